use crate::bus::BusKind;
use crate::message::Message;

/// Receives every live message the device decodes
///
/// Implementations run on the device's reader task, so they should hand the
/// message off (queue, channel) rather than do slow work inline.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, bus: BusKind, message: &Message);
}
