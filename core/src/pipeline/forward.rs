// Forwarding policy — which accepted messages get rebroadcast.

use crate::message::Message;

/// A message is forwarded iff forwarding is enabled and it either carries
/// the repeat flag or is urgent/emergency priority. The rebroadcast itself
/// forces `repeat = true`, so downstream peers re-forward at most once
/// before their own history suppresses the loop.
pub fn should_forward(message: &Message, enabled: bool) -> bool {
    enabled && (message.repeat() || message.priority().is_escalated())
}
