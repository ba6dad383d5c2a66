//! Channel ID constants.
//!
//! Channel 0 carries connection-level control traffic (handshake and close).
//! Channels 1..=channel_max are handed out to logical channels.

/// Connection-level control channel.
pub const CONTROL: u16 = 0;

/// Absolute channel ceiling of the protocol.
///
/// A peer advertising `channel_max = 0` means "no limit below this".
pub const PROTOCOL_CHANNEL_MAX: u16 = u16::MAX;

/// Channel maximum a client proposes unless configured otherwise.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Resolve an advertised channel maximum, mapping 0 to the protocol ceiling.
pub fn effective_channel_max(advertised: u16) -> u16 {
    if advertised == 0 {
        PROTOCOL_CHANNEL_MAX
    } else {
        advertised
    }
}

/// Negotiate the channel maximum between two advertised limits.
pub fn negotiate_channel_max(client: u16, server: u16) -> u16 {
    effective_channel_max(client).min(effective_channel_max(server))
}

/// Returns true for the connection-level control channel.
pub fn is_control(id: u16) -> bool {
    id == CONTROL
}
