//! Streamer WebSocket Adapters
//!
//! Everything that speaks the streamer protocol:
//!
//! - **Wire**: request encoding, frame decoding, field positions
//! - **Dispatch**: response handling, segregation into records, gap checks
//! - **Session**: the streaming client, heartbeats, reachability and the
//!   reconnect supervisor

pub mod activity;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod fields;
pub mod heartbeat;
pub mod messages;
pub mod protocol;
pub mod rate;
pub mod reachability;
pub mod segregator;
pub mod supervisor;

pub use activity::{ActivityDecoder, ActivityError, XmlActivityDecoder};
pub use client::{ClientConfig, DEFAULT_LOGIN_TIMEOUT, StreamingClient};
pub use codec::{CodecError, FrameCodec};
pub use dispatcher::{DispatchAction, Dispatcher, SessionDiagnostics};
pub use error::StreamError;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{DataMessage, FrameKind, InboundMessage, ResponseMessage};
pub use protocol::{ChartHistoryQuery, CommandBuilder, Request, encode};
pub use rate::DownloadRate;
pub use reachability::TcpProbe;
pub use segregator::{SegregatedBlock, Segregator};
pub use supervisor::{
    ConnectionLost, ReconnectConfig, ReconnectPolicy, ReconnectSupervisor, RecoveryOutcome,
    SessionControl, SupervisorConfig,
};
