pub use crate::strng;
pub use crate::strng::Strng;
pub use bytes::Bytes;
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{debug, error, info, trace, warn};
