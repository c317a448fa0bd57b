//! Application Layer - Use cases and port definitions.
//!
//! Ports describe the push transport and the alarm action API; services
//! implement the pipeline components on top of them.

/// Port interfaces for the push transport and the alarm action API.
pub mod ports;

/// Pipeline components and their composition root.
pub mod services;
