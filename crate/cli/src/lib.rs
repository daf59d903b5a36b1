pub mod actions;
pub mod commands;
pub mod error;

pub mod reexport {
    pub use pkcs11_client;
}
