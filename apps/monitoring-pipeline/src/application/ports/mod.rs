//! Application Ports (Driven)
//!
//! Interfaces the pipeline uses to reach external systems:
//! - the push transport carrying server events and subscription requests
//! - the alarm action API applying and classifying alarm actions

mod alarm_action_port;
mod transport_port;

pub use alarm_action_port::{
    ActionError, AlarmActionAck, AlarmActionPort, AlarmActionRequest, AlarmCommand, ClassificationRequest,
};
#[cfg(test)]
pub use alarm_action_port::MockAlarmActionPort;
pub use transport_port::{
    Credential, OutboundRequest, RequestAck, RequestPort, TransportError, TransportEvent, TransportLink,
    TransportPort,
};
