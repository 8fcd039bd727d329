//! Context routing for kiln.
//!
//! The [`RoutingController`] decides whether a generation request is
//! enhanced with stored conversation context, and where that context lives:
//! on a peer kiln instance reached over HTTP ([`HttpContextPeer`]) or in
//! this process's own store ([`LocalContextPeer`]).

pub mod controller;
pub mod peer;

pub use controller::{
    ConnectionTest, Enhanced, RoutingController, RoutingStatus, RoutingUpdate, ToggleOutcome,
};
pub use peer::{
    ContextPeer, EnhanceRequest, EnhanceResponse, HttpContextPeer, LocalContextPeer,
    StoreExchangeRequest,
};
