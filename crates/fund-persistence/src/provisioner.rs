// Archivo: provisioner.rs
// Propósito: crear, copiar y eliminar las cinco tablas físicas de un grupo.
// Los nombres se derivan con el registro de esquema del dominio; como la
// normalización sólo deja `[a-z0-9]` (más el prefijo y el id), interpolarlos
// en el SQL es seguro. Los valores siempre van como parámetros ligados.
//
// Semántica de fallo: el que llama envuelve cada operación en una
// transacción (el DDL de SQLite es transaccional), de modo que nunca queda
// visible un juego de tablas a medias.
use crate::fund_persistence::map_db_err;
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use fund_domain::{DomainError, GroupTableSet, Result, TableKind};

#[derive(QueryableByName)]
struct TableNameRow {
  #[diesel(sql_type = Text)]
  #[allow(dead_code)]
  name: String,
}

/// Comprueba en `sqlite_master` si la tabla existe.
pub fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
  let rows = diesel::sql_query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
    .bind::<Text, _>(table)
    .load::<TableNameRow>(conn)
    .map_err(map_db_err)?;
  Ok(!rows.is_empty())
}

fn ddl_for(kind: TableKind, table: &str) -> String {
  match kind {
    TableKind::Collection => format!(
      "CREATE TABLE IF NOT EXISTS {} (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         collection_date TEXT NOT NULL,
         group_id BIGINT NOT NULL,
         member_id BIGINT NOT NULL,
         installment_number INTEGER NOT NULL,
         collection_amount_cents BIGINT NOT NULL,
         remaining_balance_cents BIGINT NOT NULL,
         is_completed BOOLEAN NOT NULL DEFAULT 0,
         created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
         FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
         FOREIGN KEY (member_id) REFERENCES members(id)
       )",
      table
    ),
    TableKind::CollectionBalance => format!(
      "CREATE TABLE IF NOT EXISTS {} (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         group_id BIGINT NOT NULL,
         member_id BIGINT NOT NULL,
         installment_number INTEGER NOT NULL,
         total_paid_cents BIGINT NOT NULL DEFAULT 0,
         remaining_balance_cents BIGINT NOT NULL,
         is_completed BOOLEAN NOT NULL DEFAULT 0,
         export_month_number INTEGER,
         is_exported BOOLEAN NOT NULL DEFAULT 0,
         last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
         FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
         FOREIGN KEY (member_id) REFERENCES members(id),
         UNIQUE(group_id, member_id, installment_number)
       )",
      table
    ),
    TableKind::GroupMembers => format!(
      "CREATE TABLE IF NOT EXISTS {} (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         group_id BIGINT NOT NULL,
         member_id BIGINT NOT NULL,
         group_member_id TEXT NOT NULL,
         created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
         FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
         FOREIGN KEY (member_id) REFERENCES members(id),
         UNIQUE(group_id, member_id)
       )",
      table
    ),
    TableKind::ChitDates => format!(
      "CREATE TABLE IF NOT EXISTS {} (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         group_id BIGINT NOT NULL,
         chit_date TEXT NOT NULL,
         minimum_bid_cents BIGINT NOT NULL,
         created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
         FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
       )",
      table
    ),
    TableKind::MonthlySubscription => format!(
      "CREATE TABLE IF NOT EXISTS {} (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         group_id BIGINT NOT NULL,
         month_number INTEGER NOT NULL,
         bid_amount_cents BIGINT NOT NULL,
         total_dividend_cents BIGINT NOT NULL,
         distributed_dividend_cents BIGINT NOT NULL,
         monthly_subscription_cents BIGINT NOT NULL,
         created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
         FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
       )",
      table
    ),
  }
}

// Mantiene `Busy` reintentable y convierte el resto en fallo de
// aprovisionamiento.
fn as_provisioning(e: DomainError) -> DomainError {
  match e {
    DomainError::Busy(m) => DomainError::Busy(m),
    other => DomainError::Provisioning(other.to_string()),
  }
}

/// Crea las cinco tablas del grupo (CREATE IF NOT EXISTS, idempotente) y
/// devuelve los nombres resueltos.
pub fn create_group_tables(conn: &mut SqliteConnection, group_id: i64, group_name: &str) -> Result<GroupTableSet> {
  let set = GroupTableSet::new(group_id, group_name);
  for (kind, table) in TableKind::ALL.iter().zip(set.iter()) {
    diesel::sql_query(ddl_for(*kind, table)).execute(conn)
                                            .map_err(map_db_err)
                                            .map_err(as_provisioning)?;
  }
  log::info!("tablas aprovisionadas para el grupo {} ({})", group_id, group_name);
  Ok(set)
}

/// Elimina las cinco tablas del grupo. No falla si alguna ya no existe.
pub fn drop_group_tables(conn: &mut SqliteConnection, group_id: i64, group_name: &str) -> Result<()> {
  let set = GroupTableSet::new(group_id, group_name);
  for table in set.iter() {
    diesel::sql_query(format!("DROP TABLE IF EXISTS {}", table)).execute(conn)
                                                                .map_err(map_db_err)
                                                                .map_err(as_provisioning)?;
  }
  Ok(())
}

/// Renombrado con datos: crea el juego nuevo, copia todas las filas del
/// viejo y lo elimina. Si ambos nombres normalizan igual no hay nada que
/// mover.
pub fn rename_group_tables(conn: &mut SqliteConnection,
                           group_id: i64,
                           old_name: &str,
                           new_name: &str)
                           -> Result<GroupTableSet> {
  let old_set = GroupTableSet::new(group_id, old_name);
  let new_set = create_group_tables(conn, group_id, new_name)?;
  for (old_table, new_table) in old_set.iter().zip(new_set.iter()) {
    if old_table == new_table {
      continue;
    }
    if table_exists(conn, old_table)? {
      // Mismo DDL a ambos lados: el orden de columnas coincide y los ids
      // se conservan.
      diesel::sql_query(format!("INSERT INTO {} SELECT * FROM {}", new_table, old_table))
        .execute(conn)
        .map_err(map_db_err)
        .map_err(as_provisioning)?;
    }
  }
  drop_group_tables(conn, group_id, old_name)?;
  Ok(new_set)
}

/// Ajuste idempotente de esquema para tablas de saldo antiguas: añade las
/// columnas de exportación si faltan. El fallo "duplicate column name" se
/// registra y se ignora; cualquier otro se propaga.
pub fn ensure_export_columns(conn: &mut SqliteConnection, balance_table: &str) -> Result<()> {
  let alters = [format!("ALTER TABLE {} ADD COLUMN export_month_number INTEGER", balance_table),
                format!("ALTER TABLE {} ADD COLUMN is_exported BOOLEAN NOT NULL DEFAULT 0", balance_table)];
  for sql in alters {
    if let Err(e) = diesel::sql_query(sql).execute(conn) {
      if e.to_string().contains("duplicate column name") {
        log::debug!("columna de exportación ya presente en {}: {}", balance_table, e);
        continue;
      }
      return Err(map_db_err(e));
    }
  }
  Ok(())
}
