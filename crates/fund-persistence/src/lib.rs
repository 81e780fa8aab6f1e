//! Persistencia SQLite del fondo: pool r2d2, migraciones embebidas,
//! aprovisionamiento de tablas por grupo y el repositorio Diesel que
//! implementa `fund_domain::FundRepository`.
//!
//! Las tablas globales (`members`, `groups`, `users`) van por el DSL de
//! Diesel; las cinco tablas físicas de cada grupo tienen nombre derivado en
//! tiempo de ejecución y se consultan con `diesel::sql_query` y parámetros
//! ligados. Toda mutación corre como transacción bajo una política de
//! reintentos ante SQLITE_BUSY.

pub mod fund_persistence;
pub mod provisioner;
pub mod retry;
pub mod schema;

pub use fund_persistence::{new_from_env, DieselFundRepository, MIGRATIONS};
pub use retry::RetryPolicy;
