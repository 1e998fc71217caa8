use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{MembershipScheme, Periodic, SchemeContext};
use crate::error::ClusterError;
use crate::message::WireMessage;

/// Discovery by announcing on a multicast group.
///
/// Peers that hear an announcement add the sender and answer with their own
/// announcement, unicast. After the first round the scheme keeps
/// announcing at the discovery interval so late joiners find this node.
pub struct MulticastScheme {
    group: SocketAddrV4,
    discovery_interval: Duration,
    ctx: Option<SchemeContext>,
    announcer: Option<Periodic>,
}

impl MulticastScheme {
    pub fn new(group: SocketAddrV4, discovery_interval: Duration) -> Self {
        Self {
            group,
            discovery_interval,
            ctx: None,
            announcer: None,
        }
    }

    fn context(&self) -> Result<SchemeContext, ClusterError> {
        self.ctx.clone().ok_or_else(|| {
            ClusterError::MembershipInitialization("multicast scheme used before init".into())
        })
    }

    /// Broadcasts the first announcement, retrying transport errors.
    async fn announce_with_retry(&self, ctx: &SchemeContext) -> Result<(), ClusterError> {
        let settings = ctx.settings();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let announce = WireMessage::Announce {
                member: ctx.local(),
                reply_requested: true,
            };
            match ctx.channel().broadcast(announce).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= settings.max_attempts => {
                    return Err(ClusterError::MembershipFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    warn!("multicast announce to {} failed (attempt {}): {}", self.group, attempt, e);
                    sleep(settings.backoff.delay(attempt)).await;
                }
            }
        }
    }
}

#[async_trait]
impl MembershipScheme for MulticastScheme {
    fn name(&self) -> &'static str {
        "multicast"
    }

    async fn init(&mut self, ctx: SchemeContext) -> Result<(), ClusterError> {
        debug!("multicast discovery on {}", self.group);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn join_group(&mut self) -> Result<(), ClusterError> {
        let ctx = self.context()?;
        let settings = *ctx.settings();

        self.announce_with_retry(&ctx).await?;

        // wait for answers until enough members are active or the round ends
        let wanted = settings.minimum_members.max(2);
        let peers = ctx.await_active_members(wanted).await.saturating_sub(1);
        if peers == 0 {
            info!("no peers answered on {}; starting as sole member", self.group);
        } else {
            info!("discovered {} peers on {}", peers, self.group);
        }
        ctx.ensure_minimum_members()?;

        let announce_ctx = ctx.clone();
        let group = self.group;
        self.announcer = Some(Periodic::spawn(
            self.discovery_interval,
            ctx.shutdown_signal(),
            move || {
                let ctx = announce_ctx.clone();
                async move {
                    let announce = WireMessage::Announce {
                        member: ctx.local(),
                        reply_requested: false,
                    };
                    if let Err(e) = ctx.channel().broadcast(announce).await {
                        debug!("periodic announce to {} failed: {}", group, e);
                    }
                }
            },
        ));
        Ok(())
    }

    async fn leave_group(&mut self) -> Result<(), ClusterError> {
        if let Some(announcer) = self.announcer.take() {
            announcer.stop().await;
        }
        let ctx = self.context()?;
        let local = ctx.local();
        ctx.channel()
            .broadcast(WireMessage::Leave {
                id: local.id().clone(),
                incarnation: local.incarnation(),
            })
            .await
    }
}
