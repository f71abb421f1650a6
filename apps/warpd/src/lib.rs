//! warpd relays terminal bytes between one host and any number of shell
//! clients per warp. The dispatcher in [`srv`] owns the warp table; each
//! [`warp::Warp`] owns its participants and data plane.

pub mod client;
pub mod srv;
pub mod warp;

pub use srv::Srv;
