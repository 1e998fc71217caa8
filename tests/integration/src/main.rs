mod helpers;

mod coordination;
mod membership;
mod messaging;
mod multicast;
