//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                                    |
//! |-----------|---------------------------------------------------------------------|
//! | `project` | `Init`                                                              |
//! | `runs`    | `Create`, `Start`, `Decide`, `Retry`, `Regenerate`, `Cancel`, `Delete`, `SetPatcher` |
//! | `status`  | `List`, `Status`, `Artifacts`                                       |
//! | `worker`  | `Worker`, `Run`                                                     |

pub mod app;
pub mod project;
pub mod runs;
pub mod status;
pub mod worker;

pub use app::App;
pub use project::cmd_init;
pub use runs::{
    cmd_cancel, cmd_create, cmd_decide, cmd_delete, cmd_regenerate, cmd_retry, cmd_set_patcher,
    cmd_start,
};
pub use status::{cmd_artifacts, cmd_list, cmd_status};
pub use worker::{cmd_run, cmd_worker};
