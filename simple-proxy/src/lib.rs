//! Forward HTTP proxy with CONNECT tunnelling, header-rewriting forwarding
//! and a JSON diagnostic echo.

pub use simple_proxy_bin as bin;
pub use simple_proxy_config as config;
pub use simple_proxy_core as proxy;

pub use simple_proxy_config::Config;
pub use simple_proxy_core::{BoxError, RunContext, run_proxy, serve};
