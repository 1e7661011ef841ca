//! Start-Of-Frame filter.

use crate::descriptor::PacketDescriptor;
use crate::usb::Pid;

/// Marks Start-Of-Frame packets for discard when `enable` is set.
pub fn filter_sof(mut desc: PacketDescriptor, enable: bool) -> PacketDescriptor {
    if enable && desc.pid() == Some(Pid::SOF) {
        desc.discard = true;
    }
    desc
}
