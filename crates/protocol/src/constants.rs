use std::time::Duration;

/// URI scheme of a listener address, e.g. `sb://contoso.example.net/endpoint`.
pub const LISTENER_SCHEME: &str = "sb";

/// URI scheme used for the control channel and rendezvous connections.
pub const WEBSOCKET_SCHEME: &str = "wss";

/// Port used when the listener address does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// Path segment the relay mounts hybrid connection endpoints under.
pub const HYBRID_CONNECTION_PATH: &str = "$hc";

/// Query parameter carrying the control-channel action.
pub const QUERY_ACTION: &str = "sb-hc-action";

/// Query parameter carrying the tracking id.
pub const QUERY_ID: &str = "sb-hc-id";

/// Query parameter carrying the status code of a rejected rendezvous.
pub const QUERY_STATUS_CODE: &str = "sb-hc-statusCode";

/// Query parameter carrying the status description of a rejected rendezvous.
pub const QUERY_STATUS_DESCRIPTION: &str = "sb-hc-statusDescription";

/// Action value registering the connection as a listener.
pub const ACTION_LISTEN: &str = "listen";

/// Header carrying the listener credential on the control channel.
pub const AUTHORIZATION_HEADER: &str = "ServiceBusAuthorization";

/// Header carrying the client agent identifier.
pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Client agent identifier, fixed at build time.
pub const USER_AGENT: &str = concat!("tunnelrelay/", env!("CARGO_PKG_VERSION"));

/// Default control-channel buffer size (64 KB). Bounds a single command.
pub const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 64 * 1024;

/// Default timeout for `open` and `close`.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default validity requested for listener tokens.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Reason sent with a locally initiated close.
pub const CLOSE_NORMAL_REASON: &str = "Normal Closure";

/// HTTP status used when the accept handler fails.
pub const STATUS_BAD_GATEWAY: u16 = 502;

/// HTTP status used when the accept handler rejects without setting one.
pub const STATUS_FORBIDDEN: u16 = 403;
