//! Built-in contracts of the session reverse channel.
//!
//! `heartbeat` is the long poll an agent keeps open; its 200 response may
//! carry `method_calls`, the serialized requests queued for the session.
//! `heartbeat_reply` returns the outcome of one of those calls.

use crate::contract::{ClientType, MethodOptions, Verb};
use crate::decorators::{RegistryBuilder, method};
use crate::error::DefinitionError;
use crate::typing::{Signature, TypeSpec};
use serde_json::json;

pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_REPLY: &str = "heartbeat_reply";

/// Key of the queued calls in a heartbeat response.
pub const METHOD_CALLS: &str = "method_calls";

pub fn heartbeat_signature() -> Signature {
    Signature::new(HEARTBEAT)
        .param("sid", TypeSpec::Uuid)
        .param("tid", TypeSpec::Uuid)
        .param("endpoint_names", TypeSpec::list(TypeSpec::Str))
        .param("nodename", TypeSpec::Str)
        .param_default("no_hang", TypeSpec::Bool, json!(false))
}

pub fn heartbeat_reply_signature() -> Signature {
    Signature::new(HEARTBEAT_REPLY)
        .param("sid", TypeSpec::Uuid)
        .param("reply_id", TypeSpec::Uuid)
        .param("data", TypeSpec::Object)
}

/// Register `heartbeat` and `heartbeat_reply`.
pub fn register_session_methods(builder: &mut RegistryBuilder) -> Result<(), DefinitionError> {
    builder.decorate(
        heartbeat_signature(),
        [method(
            MethodOptions::new("/heartbeat")
                .operation(Verb::Post)
                .agent_server()
                .validate_sid(false)
                .client_types([ClientType::Agent]),
        )],
    )?;
    builder.decorate(
        heartbeat_reply_signature(),
        [method(
            MethodOptions::new("/heartbeat")
                .operation(Verb::Put)
                .agent_server()
                .reply(false)
                .client_types([ClientType::Agent]),
        )],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_methods_register() {
        let mut builder = RegistryBuilder::new();
        register_session_methods(&mut builder).unwrap();
        let registry = builder.freeze();

        let heartbeat = registry.get(HEARTBEAT, 1).unwrap();
        assert_eq!(heartbeat.get_full_path(), "/api/v1/heartbeat");
        assert_eq!(heartbeat.operation, Verb::Post);
        assert!(!heartbeat.validate_sid);
        assert!(!heartbeat.is_external_interface());

        let reply = registry.get(HEARTBEAT_REPLY, 1).unwrap();
        assert_eq!(reply.operation, Verb::Put);
        assert!(reply.validate_sid);
        assert!(!reply.reply);
    }
}
