use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{MembershipScheme, Periodic, SchemeContext};
use crate::error::ClusterError;
use crate::member::{Member, MemberId};
use crate::message::WireMessage;

/// Discovery through a fixed list of well-known addresses.
///
/// Joining sends a `JoinRequest` to every listed address except this node's
/// own. Each answer carries the responder's membership list, which is merged
/// before this node announces itself to everyone it learned about. If no
/// listed member answers, the node starts a group of its own and keeps
/// announcing itself to the silent addresses in the background.
pub struct WkaScheme {
    entries: Vec<String>,
    retry_interval: Duration,
    peers: Vec<SocketAddr>,
    ctx: Option<SchemeContext>,
    retry: Option<Periodic>,
}

#[derive(Default)]
struct Round {
    responses: Vec<(MemberId, Vec<Member>)>,
    send_failures: usize,
    last_error: Option<String>,
}

impl WkaScheme {
    pub fn new(entries: Vec<String>, retry_interval: Duration) -> Self {
        Self {
            entries,
            retry_interval,
            peers: Vec::new(),
            ctx: None,
            retry: None,
        }
    }

    /// Resolved well-known addresses, own address excluded.
    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    fn context(&self) -> Result<SchemeContext, ClusterError> {
        self.ctx.clone().ok_or_else(|| {
            ClusterError::MembershipInitialization("wka scheme used before init".into())
        })
    }

    async fn handshake_round(&self, ctx: &SchemeContext) -> Round {
        let mut round = Round::default();
        let local = ctx.local();
        let mut waiting = Vec::with_capacity(self.peers.len());

        for &peer in &self.peers {
            let nonce: u64 = rand::random();
            let response = ctx.expect_join_response(nonce);
            let request = WireMessage::JoinRequest {
                nonce,
                member: local.clone(),
            };
            match ctx.channel().send(peer, request).await {
                Ok(()) => waiting.push((nonce, response)),
                Err(e) => {
                    ctx.abandon_join_response(nonce);
                    round.send_failures += 1;
                    round.last_error = Some(format!("{peer}: {e}"));
                }
            }
        }

        let deadline = Instant::now() + ctx.settings().round_timeout;
        for (nonce, response) in waiting {
            match timeout_at(deadline, response).await {
                Ok(Ok(answer)) => round.responses.push(answer),
                _ => ctx.abandon_join_response(nonce),
            }
        }
        round
    }

    fn start_retries(&mut self, ctx: &SchemeContext) {
        let ctx = ctx.clone();
        let peers = self.peers.clone();
        self.retry = Some(Periodic::spawn(
            self.retry_interval,
            ctx.shutdown_signal(),
            move || {
                let ctx = ctx.clone();
                let peers = peers.clone();
                async move { announce_to_unknown(&ctx, &peers).await }
            },
        ));
    }
}

/// Announces this node to every well-known address that no live member
/// currently occupies.
async fn announce_to_unknown(ctx: &SchemeContext, peers: &[SocketAddr]) {
    let known: Vec<SocketAddr> = ctx
        .directory()
        .snapshot()
        .iter()
        .map(|record| record.member.addr())
        .collect();
    let silent: Vec<SocketAddr> = peers
        .iter()
        .copied()
        .filter(|addr| !known.contains(addr))
        .collect();
    if silent.is_empty() {
        return;
    }
    debug!("announcing to {} unreachable well-known members", silent.len());
    let announce = WireMessage::Announce {
        member: ctx.local(),
        reply_requested: true,
    };
    ctx.channel().send_all(silent, announce).await;
}

#[async_trait]
impl MembershipScheme for WkaScheme {
    fn name(&self) -> &'static str {
        "wka"
    }

    async fn init(&mut self, ctx: SchemeContext) -> Result<(), ClusterError> {
        let own = [ctx.channel().local_addr(), ctx.local().addr()];
        let mut peers = Vec::new();
        for entry in &self.entries {
            match lookup_host(entry.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if !own.contains(&addr) && !peers.contains(&addr) {
                            peers.push(addr);
                        }
                    }
                }
                Err(e) => warn!("could not resolve well-known member '{}': {}", entry, e),
            }
        }
        debug!("well-known members: {:?}", peers);
        self.peers = peers;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn join_group(&mut self) -> Result<(), ClusterError> {
        let ctx = self.context()?;
        let settings = *ctx.settings();

        if self.peers.is_empty() {
            info!("no other well-known members configured; starting as sole member");
            return ctx.ensure_minimum_members();
        }

        let mut joined = false;
        let mut transport_failure = None;
        for attempt in 1..=settings.max_attempts {
            let round = self.handshake_round(&ctx).await;

            if !round.responses.is_empty() {
                let mut responders = Vec::with_capacity(round.responses.len());
                for (responder, members) in round.responses {
                    ctx.merge(members, Some(responder.clone())).await?;
                    responders.push(responder);
                }
                // introduce ourselves to members we only heard about
                let local_id = ctx.local().id().clone();
                let targets: Vec<SocketAddr> = ctx
                    .directory()
                    .snapshot()
                    .into_iter()
                    .filter(|r| *r.member.id() != local_id && !responders.contains(r.member.id()))
                    .map(|r| r.member.addr())
                    .collect();
                let announce = WireMessage::Announce {
                    member: ctx.local(),
                    reply_requested: true,
                };
                ctx.channel().send_all(targets, announce).await;

                // members learned from a snapshot count once they answer
                let active = ctx.await_active_members(settings.minimum_members).await;
                info!(
                    "joined through {} well-known members; {} of {} known members active",
                    responders.len(),
                    active,
                    ctx.directory().len()
                );
                joined = true;
                break;
            }

            transport_failure = if round.send_failures == self.peers.len() {
                warn!(
                    "attempt {}: could not send to any well-known member",
                    attempt
                );
                round.last_error
            } else {
                debug!("attempt {}: no well-known member answered", attempt);
                None
            };

            if attempt < settings.max_attempts {
                sleep(settings.backoff.delay(attempt)).await;
            }
        }

        if !joined {
            if let Some(reason) = transport_failure {
                return Err(ClusterError::MembershipFailed {
                    attempts: settings.max_attempts,
                    reason,
                });
            }
            info!(
                "no well-known member answered after {} attempts; starting as sole member",
                settings.max_attempts
            );
        }

        ctx.ensure_minimum_members()?;
        self.start_retries(&ctx);
        Ok(())
    }

    async fn leave_group(&mut self) -> Result<(), ClusterError> {
        if let Some(retry) = self.retry.take() {
            retry.stop().await;
        }
        let ctx = self.context()?;
        let local = ctx.local();
        let targets: Vec<SocketAddr> = ctx
            .directory()
            .snapshot()
            .into_iter()
            .filter(|r| r.member.id() != local.id())
            .map(|r| r.member.addr())
            .collect();
        let total = targets.len();
        let failed = ctx
            .channel()
            .send_all(
                targets,
                WireMessage::Leave {
                    id: local.id().clone(),
                    incarnation: local.incarnation(),
                },
            )
            .await;
        if total > 0 && failed == total {
            return Err(ClusterError::Network(format!(
                "leave notice reached none of {total} members"
            )));
        }
        Ok(())
    }
}
