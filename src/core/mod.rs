//! 核心层：错误类型、尽力而为的副作用、优雅关闭

pub mod effects;
pub mod error;
pub mod shutdown;

pub use effects::spawn_best_effort;
pub use error::{GatewayError, StoreError, SubagentError};
pub use shutdown::{
    run_with_graceful_shutdown, GatewayCloseCleanup, RegistryFlushCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
