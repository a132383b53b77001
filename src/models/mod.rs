// Data structures and types

pub mod connection;

pub use connection::{
    ConnectionConfig, DriverOptions, SshAuth, SshOptionsInput, SshTunnelConfig, StoredConnection,
    parse_driver_options,
};
