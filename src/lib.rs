//! Voxlink - real-time voice streaming client for conversational avatars
//!
//! This library implements the client side of a streamed voice conversation:
//! - Microphone capture and conversion to the canonical wire format
//! - A session protocol multiplexing JSON control messages and binary audio
//!   frames over one persistent WebSocket connection
//! - Gapless scheduling of streamed synthesis audio onto the output device
//! - A viseme relay forwarding mouth-shape intensity to an external renderer
//!
//! # Architecture
//!
//! ```text
//! microphone ──▶ Capture ──▶ Converter ──▶ Session ──▶ network
//!                                            │
//!            transcript / reply text ◀───────┤
//!            speaker ◀── Playback ◀──────────┤
//!            renderer ◀── Viseme relay ◀─────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod viseme;

pub use audio::{AudioFrame, CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE, PlaybackSink};
pub use client::{ClientCommand, VoiceClient};
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Session, SessionEvent, SessionState};
pub use viseme::{VisemeRelay, VisemeSink};
