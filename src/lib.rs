//! Concord's coordination fabric: the event hub, the voice session/room/
//! router pipeline, and the voice-server registry/assigner. Both binaries
//! in `src/bin/` are thin composition roots over these modules.

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod membership;
pub mod registrar;
pub mod registry;
pub mod room;
pub mod router;
pub mod session;
pub mod stream;
pub mod token;
pub mod udp_wire;
pub mod voice_udp;
