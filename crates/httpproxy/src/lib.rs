//! HTTP CONNECT / forward-proxy protocol handling shared by the proxy role (tunneling over a
//! QUIC-backed [`dialer::Dialer`]) and the load-balancer role (tunneling over a TCP/TLS one).
//! Deliberately has no dependency on the tunnel transport itself.

pub mod auth;
pub mod dialer;
pub mod handler;
pub mod lb_dialer;

pub use auth::{ClientAuthenticator, JwtClientAuthenticator, NoAuthClientAuthenticator};
pub use dialer::{BoxedUpstream, DialContext, Dialer, DirectDialer, HttpConnector, RawDialer, UpstreamStream};
pub use handler::{HandlerConfig, serve};
pub use lb_dialer::LoadBalancerDialer;
