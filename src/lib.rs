//! Typed RPC layer of the orchestrator.
//!
//! A method is declared once as a [`MethodContract`](contract::MethodContract)
//! and used from both sides: clients build requests from it and decode typed
//! responses, servers bind handlers to it through a
//! [`CallTarget`](server::CallTarget). Agents without a listening port are
//! reached through the heartbeat reverse channel in [`session`].

pub mod client;
pub mod codec;
pub mod config;
pub mod contract;
pub mod decorators;
pub mod error;
pub mod logging;
pub mod message;
pub mod methods;
pub mod metrics;
pub mod server;
pub mod session;
pub mod typing;
pub mod url_path;

pub use client::{Client, RestTransport, SessionClient, SyncClient, Transport, TypedClient, VersionMatch};
pub use config::RpcConfig;
pub use contract::{ArgOption, ClientType, MethodContract, MethodOptions, Verb};
pub use decorators::{Registry, RegistryBuilder, auth, handle, method, typedmethod};
pub use error::{ClientError, DefinitionError, HandlerError, HttpError, HttpErrorKind, ValidationError};
pub use message::{CallResult, Request, Response, ReturnValue};
pub use server::{CallTarget, Handler, handler_fn};
pub use session::{SessionEndpoint, SessionHooks, SessionState, SessionTransports};
pub use typing::{Signature, TypeSpec};
pub use url_path::UrlPath;
