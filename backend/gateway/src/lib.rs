//! `relgate-gateway` — the authorizing request pipeline and its HTTP surface.
//!
//! [`Dispatcher`] matches a request against the rule table, runs its checks,
//! and then either reads through the filters or writes through the
//! [`TransactionCoordinator`].

pub mod auth;
pub mod config_reload;
pub mod context;
pub mod dispatcher;
pub mod filter;
pub mod server;
pub mod txn;
pub mod watch;

pub use auth::Identity;
pub use config_reload::RuleReloader;
pub use context::{object_context, ApiRequest};
pub use dispatcher::{merge_patch, Dispatcher, Reply};
pub use filter::{admit_object, all_allowed, post_filter, pre_filter, Narrowing};
pub use server::{build_router, parse_api_path, start_server, ApiError, GatewayState};
pub use txn::{Mutation, Transaction, TransactionCoordinator, TxnReport, TxnState};
pub use watch::WatchFilter;
