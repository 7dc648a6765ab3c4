//! # tenvis-junction-core
//!
//! Routing core for Junction: realms, sessions, the broker and dealer, and an
//! in-process client.
//!
//! - **Router** - set of realms, admits sessions with HELLO details
//! - **Realm** - subscriptions, registrations and in-flight calls
//! - **Client** - a session joined without a transport
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  join/handle  ┌─────────────┐     ┌─────────────┐
//! │  Transport  │──────────────▶│   Router    │────▶│    Realm    │
//! └─────────────┘               └─────────────┘     └─────────────┘
//!        ▲                                                 │
//!        └──────────────── outbound channel ───────────────┘
//! ```

pub mod client;
pub mod id;
pub mod metrics;
pub mod realm;
pub mod router;
pub mod session;

pub use client::{
    CallResult, Client, ClientConfig, ClientError, Event, Invocation, InvocationHandler,
    InvokeResult, Subscription,
};
pub use realm::{Realm, RealmConfig};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
pub use session::{Outbound, Session, SessionDetails, TransportDetails, TransportKind};
