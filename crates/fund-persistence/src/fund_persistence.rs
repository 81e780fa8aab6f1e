use crate::provisioner;
use crate::retry::RetryPolicy;
use crate::schema;
use crate::schema::groups::dsl as groups_dsl;
use crate::schema::members::dsl as members_dsl;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use fund_domain::{build_schedule, from_cents, installment_summary, to_cents, validate_collection_amount,
                  BalanceRecord, BalanceState, ChitDate, CollectionEvent, CustomerSheetRow, DomainError,
                  FundRepository, Group, GroupMember, GroupStatus, GroupTableSet, GroupTerms, InstallmentBalance,
                  Member, MemberStatus, NewChitDate, NewGroup, NewMember, Result, SubscriptionLine,
                  DEFAULT_COMMISSION_PERCENTAGE};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Clasifica un error de Diesel según la taxonomía del dominio. SQLITE_BUSY
/// llega como DatabaseError con mensaje "database is locked".
pub(crate) fn map_db_err(e: DieselError) -> DomainError {
  match e {
    DieselError::NotFound => DomainError::NotFound("fila no encontrada".to_string()),
    DieselError::DatabaseError(kind, info) => {
      let msg = info.message().to_string();
      if msg.contains("database is locked") || msg.contains("database table is locked") {
        return DomainError::Busy(msg);
      }
      match kind {
        DatabaseErrorKind::UniqueViolation
        | DatabaseErrorKind::ForeignKeyViolation
        | DatabaseErrorKind::NotNullViolation
        | DatabaseErrorKind::CheckViolation => DomainError::Constraint(msg),
        _ => DomainError::Storage(format!("db: {}", msg)),
      }
    }
    other => DomainError::Storage(format!("db: {}", other)),
  }
}

/// Error interno de transacción: permite usar `?` dentro del cierre tanto
/// con errores de Diesel como del dominio, y colapsa a `DomainError` al
/// salir. El cierre transaccional garantiza commit-o-rollback en toda
/// salida.
#[derive(Debug)]
pub(crate) enum TxError {
  Domain(DomainError),
  Db(DieselError),
}

impl From<DieselError> for TxError {
  fn from(e: DieselError) -> Self {
    TxError::Db(e)
  }
}

impl From<DomainError> for TxError {
  fn from(e: DomainError) -> Self {
    TxError::Domain(e)
  }
}

impl TxError {
  pub(crate) fn into_domain(self) -> DomainError {
    match self {
      TxError::Domain(e) => e,
      TxError::Db(e) => map_db_err(e),
    }
  }
}

// Pragmas por conexión: el pool entrega conexiones nuevas y cada una debe
// llevar WAL, busy_timeout y claves foráneas activas.
#[derive(Debug)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
    for pragma in ["PRAGMA journal_mode = WAL;", "PRAGMA busy_timeout = 5000;", "PRAGMA foreign_keys = ON;"] {
      diesel::sql_query(pragma).execute(conn).map_err(diesel::r2d2::Error::QueryError)?;
    }
    Ok(())
  }
}

/// Repositorio Diesel/SQLite que implementa `FundRepository`.
pub struct DieselFundRepository {
  pool: Arc<DbPool>,
  retry: RetryPolicy,
}

impl DieselFundRepository {
  pub fn new(database_url: &str) -> Result<Self> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder().max_size(4)
                              .connection_customizer(Box::new(ConnectionPragmas))
                              .build(manager)
                              .map_err(|e| DomainError::Storage(format!("pool: {}", e)))?;
    let repo = DieselFundRepository { pool: Arc::new(pool), retry: RetryPolicy::default() };
    let mut conn = repo.conn()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DomainError::Storage(format!("migraciones: {}", e)))?;
    Ok(repo)
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  fn conn(&self) -> Result<DbConn> {
    self.pool.get().map_err(|e| DomainError::Storage(format!("pool: {}", e)))
  }

  /// Ejecuta `op` como transacción, con la política de reintentos por
  /// encima y una conexión fresca del pool en cada intento.
  fn tx<T, F>(&self, mut op: F) -> Result<T>
    where F: FnMut(&mut SqliteConnection) -> std::result::Result<T, TxError>
  {
    self.retry.run(|| {
               let mut conn = self.conn()?;
               conn.transaction::<T, TxError, _>(|conn| op(conn)).map_err(TxError::into_domain)
             })
  }
}

/// Crea el repositorio desde el entorno: `FUND_DB_URL` o `DATABASE_URL`,
/// con `chitfund.db` en el directorio actual como último recurso.
pub fn new_from_env() -> Result<DieselFundRepository> {
  dotenvy::dotenv().ok();
  let url = std::env::var("FUND_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                        .unwrap_or_else(|_| "chitfund.db".to_string());
  DieselFundRepository::new(&url)
}

// ---------------------------------------------------------------------------
// Filas Diesel de las tablas globales
// ---------------------------------------------------------------------------

#[derive(Debug, Queryable)]
struct MemberRow {
  id: i64,
  name: String,
  phone: Option<String>,
  address: Option<String>,
  email: Option<String>,
  status: String,
}

#[derive(Insertable)]
#[diesel(table_name = schema::members)]
struct NewMemberRow<'a> {
  name: &'a str,
  phone: Option<&'a str>,
  address: Option<&'a str>,
  email: Option<&'a str>,
  status: &'a str,
}

#[derive(Debug, Queryable, Clone)]
struct GroupRow {
  id: i64,
  name: String,
  total_amount_cents: i64,
  member_count: i32,
  start_date: String,
  end_date: String,
  number_of_months: i32,
  commission_percentage: String,
  status: String,
}

#[derive(Insertable)]
#[diesel(table_name = schema::groups)]
struct NewGroupRow<'a> {
  name: &'a str,
  total_amount_cents: i64,
  member_count: i32,
  start_date: String,
  end_date: String,
  number_of_months: i32,
  commission_percentage: String,
  status: &'a str,
}

fn row_to_member(r: MemberRow) -> Result<Member> {
  Ok(Member { id: r.id,
              name: r.name,
              phone: r.phone,
              address: r.address,
              email: r.email,
              status: MemberStatus::parse(&r.status)? })
}

fn parse_stored_date(s: &str) -> Result<chrono::NaiveDate> {
  chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| DomainError::Validation(format!("fecha almacenada malformada '{}': {}", s, e)))
}

fn row_to_group(r: GroupRow) -> Result<Group> {
  let commission = Decimal::from_str(&r.commission_percentage)
    .map_err(|e| DomainError::Validation(format!("comisión almacenada malformada '{}': {}", r.commission_percentage, e)))?;
  Ok(Group { id: r.id,
             name: r.name,
             total_amount: from_cents(r.total_amount_cents),
             member_count: r.member_count,
             start_date: parse_stored_date(&r.start_date)?,
             end_date: parse_stored_date(&r.end_date)?,
             number_of_months: r.number_of_months,
             commission_percentage: commission,
             status: GroupStatus::parse(&r.status)? })
}

fn group_terms(r: &GroupRow) -> Result<GroupTerms> {
  let commission = Decimal::from_str(&r.commission_percentage)
    .map_err(|e| DomainError::Validation(format!("comisión almacenada malformada '{}': {}", r.commission_percentage, e)))?;
  Ok(GroupTerms { total_amount: from_cents(r.total_amount_cents),
                  member_count: r.member_count,
                  number_of_months: r.number_of_months,
                  commission_percentage: commission })
}

// ---------------------------------------------------------------------------
// Filas de las tablas dinámicas (sql_query + QueryableByName)
// ---------------------------------------------------------------------------

#[derive(QueryableByName)]
struct PresenceRow {
  #[diesel(sql_type = Integer)]
  #[allow(dead_code)]
  present: i32,
}

#[derive(QueryableByName)]
struct CentsRow {
  #[diesel(sql_type = BigInt)]
  cents: i64,
}

#[derive(QueryableByName)]
struct IdRow {
  #[diesel(sql_type = BigInt)]
  id: i64,
}

#[derive(QueryableByName)]
struct BalanceStateRow {
  #[diesel(sql_type = BigInt)]
  total_paid_cents: i64,
  #[diesel(sql_type = BigInt)]
  remaining_balance_cents: i64,
  #[diesel(sql_type = Bool)]
  is_completed: bool,
}

#[derive(QueryableByName)]
struct BalanceRow {
  #[diesel(sql_type = BigInt)]
  group_id: i64,
  #[diesel(sql_type = BigInt)]
  member_id: i64,
  #[diesel(sql_type = Integer)]
  installment_number: i32,
  #[diesel(sql_type = BigInt)]
  total_paid_cents: i64,
  #[diesel(sql_type = BigInt)]
  remaining_balance_cents: i64,
  #[diesel(sql_type = Bool)]
  is_completed: bool,
  #[diesel(sql_type = Nullable<Integer>)]
  export_month_number: Option<i32>,
  #[diesel(sql_type = Bool)]
  is_exported: bool,
}

#[derive(QueryableByName)]
struct CollectionRow {
  #[diesel(sql_type = BigInt)]
  id: i64,
  #[diesel(sql_type = Text)]
  collection_date: String,
  #[diesel(sql_type = BigInt)]
  group_id: i64,
  #[diesel(sql_type = BigInt)]
  member_id: i64,
  #[diesel(sql_type = Integer)]
  installment_number: i32,
  #[diesel(sql_type = BigInt)]
  collection_amount_cents: i64,
  #[diesel(sql_type = BigInt)]
  remaining_balance_cents: i64,
  #[diesel(sql_type = Bool)]
  is_completed: bool,
}

#[derive(QueryableByName)]
struct GroupMemberRow {
  #[diesel(sql_type = BigInt)]
  id: i64,
  #[diesel(sql_type = BigInt)]
  group_id: i64,
  #[diesel(sql_type = BigInt)]
  member_id: i64,
  #[diesel(sql_type = Text)]
  group_member_id: String,
}

#[derive(QueryableByName)]
struct ChitDateRow {
  #[diesel(sql_type = BigInt)]
  id: i64,
  #[diesel(sql_type = BigInt)]
  group_id: i64,
  #[diesel(sql_type = Text)]
  chit_date: String,
  #[diesel(sql_type = BigInt)]
  minimum_bid_cents: i64,
}

#[derive(QueryableByName)]
struct SubscriptionRow {
  #[diesel(sql_type = Integer)]
  month_number: i32,
  #[diesel(sql_type = BigInt)]
  bid_amount_cents: i64,
  #[diesel(sql_type = BigInt)]
  total_dividend_cents: i64,
  #[diesel(sql_type = BigInt)]
  distributed_dividend_cents: i64,
  #[diesel(sql_type = BigInt)]
  monthly_subscription_cents: i64,
}

#[derive(QueryableByName)]
struct SheetRow {
  #[diesel(sql_type = BigInt)]
  member_id: i64,
  #[diesel(sql_type = Text)]
  member_name: String,
  #[diesel(sql_type = Integer)]
  installment_number: i32,
  #[diesel(sql_type = BigInt)]
  total_paid_cents: i64,
  #[diesel(sql_type = BigInt)]
  remaining_balance_cents: i64,
  #[diesel(sql_type = Bool)]
  is_completed: bool,
}

fn row_to_collection(r: CollectionRow) -> Result<CollectionEvent> {
  Ok(CollectionEvent { id: r.id,
                       group_id: r.group_id,
                       member_id: r.member_id,
                       installment_number: r.installment_number,
                       amount: from_cents(r.collection_amount_cents),
                       collection_date: parse_stored_date(&r.collection_date)?,
                       remaining_balance: from_cents(r.remaining_balance_cents),
                       is_completed: r.is_completed })
}

fn row_to_balance(r: BalanceRow) -> BalanceRecord {
  BalanceRecord { group_id: r.group_id,
                  member_id: r.member_id,
                  installment_number: r.installment_number,
                  total_paid: from_cents(r.total_paid_cents),
                  remaining_balance: from_cents(r.remaining_balance_cents),
                  is_completed: r.is_completed,
                  export_month_number: r.export_month_number,
                  is_exported: r.is_exported }
}

// ---------------------------------------------------------------------------
// Ayudas internas (se ejecutan dentro de la transacción del que llama)
// ---------------------------------------------------------------------------

fn last_insert_rowid(conn: &mut SqliteConnection) -> Result<i64> {
  diesel::sql_query("SELECT last_insert_rowid() AS id").get_result::<IdRow>(conn)
                                                       .map(|r| r.id)
                                                       .map_err(map_db_err)
}

fn load_group_row(conn: &mut SqliteConnection, id: i64) -> Result<GroupRow> {
  groups_dsl::groups.find(id)
                    .first::<GroupRow>(conn)
                    .optional()
                    .map_err(map_db_err)?
                    .ok_or_else(|| DomainError::NotFound(format!("grupo {}", id)))
}

fn member_exists(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
  let found = members_dsl::members.find(id)
                                  .select(members_dsl::id)
                                  .first::<i64>(conn)
                                  .optional()
                                  .map_err(map_db_err)?;
  Ok(found.is_some())
}

fn check_name_collision(conn: &mut SqliteConnection, name: &str, exclude_group: Option<i64>) -> Result<()> {
  let wanted = fund_domain::sanitize_group_name(name);
  if name.trim().is_empty() || wanted.is_empty() {
    return Err(DomainError::Validation("el nombre del grupo debe contener algún carácter alfanumérico".to_string()));
  }
  let rows = groups_dsl::groups.select((groups_dsl::id, groups_dsl::name))
                               .load::<(i64, String)>(conn)
                               .map_err(map_db_err)?;
  for (id, existing) in rows {
    if Some(id) != exclude_group && fund_domain::sanitize_group_name(&existing) == wanted {
      return Err(DomainError::Constraint(format!("el nombre '{}' colisiona con el grupo '{}' tras normalizar",
                                                 name, existing)));
    }
  }
  Ok(())
}

/// Cuota en céntimos del período: línea persistida del calendario si la
/// hay; si no, la suscripción base derivada de la fila del grupo.
fn due_cents_for(conn: &mut SqliteConnection, group: &GroupRow, tables: &GroupTableSet, installment: i32) -> Result<i64> {
  if provisioner::table_exists(conn, &tables.subscriptions)? {
    let sql = format!("SELECT monthly_subscription_cents AS cents FROM {} WHERE month_number = ?", tables.subscriptions);
    let row = diesel::sql_query(sql).bind::<Integer, _>(installment)
                                    .get_result::<CentsRow>(conn)
                                    .optional()
                                    .map_err(map_db_err)?;
    if let Some(r) = row {
      return Ok(r.cents);
    }
  }
  to_cents(group_terms(group)?.base_subscription())
}

fn load_balance_state(conn: &mut SqliteConnection,
                      balance_table: &str,
                      member_id: i64,
                      installment: i32)
                      -> Result<Option<BalanceState>> {
  let sql = format!("SELECT total_paid_cents, remaining_balance_cents, is_completed FROM {} \
                     WHERE member_id = ? AND installment_number = ?",
                    balance_table);
  let row = diesel::sql_query(sql).bind::<BigInt, _>(member_id)
                                  .bind::<Integer, _>(installment)
                                  .get_result::<BalanceStateRow>(conn)
                                  .optional()
                                  .map_err(map_db_err)?;
  Ok(row.map(|r| BalanceState { total_paid: from_cents(r.total_paid_cents),
                                remaining_balance: from_cents(r.remaining_balance_cents),
                                is_completed: r.is_completed }))
}

fn write_balance_state(conn: &mut SqliteConnection,
                       balance_table: &str,
                       group_id: i64,
                       member_id: i64,
                       installment: i32,
                       state: &BalanceState,
                       existed: bool)
                       -> Result<()> {
  let total = to_cents(state.total_paid)?;
  let remaining = to_cents(state.remaining_balance)?;
  if existed {
    let sql = format!("UPDATE {} SET total_paid_cents = ?, remaining_balance_cents = ?, is_completed = ?, \
                       last_updated = CURRENT_TIMESTAMP WHERE group_id = ? AND member_id = ? AND installment_number = ?",
                      balance_table);
    diesel::sql_query(sql).bind::<BigInt, _>(total)
                          .bind::<BigInt, _>(remaining)
                          .bind::<Bool, _>(state.is_completed)
                          .bind::<BigInt, _>(group_id)
                          .bind::<BigInt, _>(member_id)
                          .bind::<Integer, _>(installment)
                          .execute(conn)
                          .map_err(map_db_err)?;
  } else {
    let sql = format!("INSERT INTO {} (group_id, member_id, installment_number, total_paid_cents, \
                       remaining_balance_cents, is_completed) VALUES (?, ?, ?, ?, ?, ?)",
                      balance_table);
    diesel::sql_query(sql).bind::<BigInt, _>(group_id)
                          .bind::<BigInt, _>(member_id)
                          .bind::<Integer, _>(installment)
                          .bind::<BigInt, _>(total)
                          .bind::<BigInt, _>(remaining)
                          .bind::<Bool, _>(state.is_completed)
                          .execute(conn)
                          .map_err(map_db_err)?;
  }
  Ok(())
}

fn load_collection(conn: &mut SqliteConnection, collection_table: &str, id: i64) -> Result<Option<CollectionRow>> {
  let sql = format!("SELECT id, collection_date, group_id, member_id, installment_number, collection_amount_cents, \
                     remaining_balance_cents, is_completed FROM {} WHERE id = ?",
                    collection_table);
  diesel::sql_query(sql).bind::<BigInt, _>(id)
                        .get_result::<CollectionRow>(conn)
                        .optional()
                        .map_err(map_db_err)
}

impl FundRepository for DieselFundRepository {
  fn create_member(&self, member: NewMember) -> Result<Member> {
    member.validate()?;
    self.tx(|conn| {
          let row = NewMemberRow { name: &member.name,
                                   phone: member.phone.as_deref(),
                                   address: member.address.as_deref(),
                                   email: member.email.as_deref(),
                                   status: MemberStatus::Active.as_str() };
          diesel::insert_into(members_dsl::members).values(&row).execute(conn)?;
          let id = last_insert_rowid(conn)?;
          Ok(Member { id,
                      name: member.name.clone(),
                      phone: member.phone.clone(),
                      address: member.address.clone(),
                      email: member.email.clone(),
                      status: MemberStatus::Active })
        })
  }

  fn get_member(&self, id: i64) -> Result<Option<Member>> {
    let mut conn = self.conn()?;
    let row = members_dsl::members.find(id).first::<MemberRow>(&mut conn).optional().map_err(map_db_err)?;
    row.map(row_to_member).transpose()
  }

  fn list_members(&self) -> Result<Vec<Member>> {
    let mut conn = self.conn()?;
    let rows = members_dsl::members.order(members_dsl::id.asc())
                                   .load::<MemberRow>(&mut conn)
                                   .map_err(map_db_err)?;
    rows.into_iter().map(row_to_member).collect()
  }

  fn update_member(&self, id: i64, member: NewMember, status: MemberStatus) -> Result<Member> {
    member.validate()?;
    self.tx(|conn| {
          let updated = diesel::update(members_dsl::members.find(id))
            .set((members_dsl::name.eq(&member.name),
                  members_dsl::phone.eq(member.phone.as_deref()),
                  members_dsl::address.eq(member.address.as_deref()),
                  members_dsl::email.eq(member.email.as_deref()),
                  members_dsl::status.eq(status.as_str())))
            .execute(conn)?;
          if updated == 0 {
            return Err(DomainError::NotFound(format!("socio {}", id)).into());
          }
          Ok(Member { id,
                      name: member.name.clone(),
                      phone: member.phone.clone(),
                      address: member.address.clone(),
                      email: member.email.clone(),
                      status })
        })
  }

  fn delete_member(&self, id: i64) -> Result<()> {
    self.tx(|conn| {
          if !member_exists(conn, id)? {
            return Err(DomainError::NotFound(format!("socio {}", id)).into());
          }
          // Recorre las tablas de inscripción de todos los grupos: no se
          // borra un socio inscrito.
          let groups = groups_dsl::groups.select((groups_dsl::id, groups_dsl::name)).load::<(i64, String)>(conn)?;
          for (gid, gname) in groups {
            let tables = GroupTableSet::new(gid, &gname);
            if !provisioner::table_exists(conn, &tables.members)? {
              continue;
            }
            let sql = format!("SELECT 1 AS present FROM {} WHERE member_id = ? LIMIT 1", tables.members);
            let enrolled = diesel::sql_query(sql).bind::<BigInt, _>(id)
                                                 .get_result::<PresenceRow>(conn)
                                                 .optional()?;
            if enrolled.is_some() {
              return Err(DomainError::Constraint(format!("no se puede borrar el socio {}; está inscrito en el grupo {}",
                                                         id, gid)).into());
            }
          }
          diesel::delete(members_dsl::members.find(id)).execute(conn)?;
          Ok(())
        })
  }

  fn create_group(&self, group: NewGroup) -> Result<Group> {
    let commission = group.commission_percentage.unwrap_or(DEFAULT_COMMISSION_PERCENTAGE);
    let terms = GroupTerms { total_amount: group.total_amount,
                             member_count: group.member_count,
                             number_of_months: group.number_of_months,
                             commission_percentage: commission };
    terms.validate()?;
    let total_cents = to_cents(group.total_amount)?;
    self.tx(|conn| {
          check_name_collision(conn, &group.name, None)?;
          let row = NewGroupRow { name: &group.name,
                                  total_amount_cents: total_cents,
                                  member_count: group.member_count,
                                  start_date: group.start_date.to_string(),
                                  end_date: group.end_date.to_string(),
                                  number_of_months: group.number_of_months,
                                  commission_percentage: commission.to_string(),
                                  status: GroupStatus::Active.as_str() };
          diesel::insert_into(groups_dsl::groups).values(&row).execute(conn)?;
          let id = last_insert_rowid(conn)?;
          provisioner::create_group_tables(conn, id, &group.name)?;
          Ok(Group { id,
                     name: group.name.clone(),
                     total_amount: group.total_amount,
                     member_count: group.member_count,
                     start_date: group.start_date,
                     end_date: group.end_date,
                     number_of_months: group.number_of_months,
                     commission_percentage: commission,
                     status: GroupStatus::Active })
        })
  }

  fn get_group(&self, id: i64) -> Result<Option<Group>> {
    let mut conn = self.conn()?;
    let row = groups_dsl::groups.find(id).first::<GroupRow>(&mut conn).optional().map_err(map_db_err)?;
    row.map(row_to_group).transpose()
  }

  fn list_groups(&self) -> Result<Vec<Group>> {
    let mut conn = self.conn()?;
    let rows = groups_dsl::groups.order(groups_dsl::id.asc()).load::<GroupRow>(&mut conn).map_err(map_db_err)?;
    rows.into_iter().map(row_to_group).collect()
  }

  fn rename_group(&self, id: i64, new_name: &str) -> Result<Group> {
    self.tx(|conn| {
          let row = load_group_row(conn, id)?;
          check_name_collision(conn, new_name, Some(id))?;
          provisioner::rename_group_tables(conn, id, &row.name, new_name)?;
          diesel::update(groups_dsl::groups.find(id)).set(groups_dsl::name.eq(new_name)).execute(conn)?;
          row_to_group(GroupRow { name: new_name.to_string(), ..row }).map_err(TxError::from)
        })
  }

  fn update_group_terms(&self, id: i64, terms: GroupTerms, chit_dates: Vec<NewChitDate>) -> Result<Group> {
    terms.validate()?;
    let total_cents = to_cents(terms.total_amount)?;
    self.tx(|conn| {
          let row = load_group_row(conn, id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          diesel::update(groups_dsl::groups.find(id))
            .set((groups_dsl::total_amount_cents.eq(total_cents),
                  groups_dsl::member_count.eq(terms.member_count),
                  groups_dsl::number_of_months.eq(terms.number_of_months),
                  groups_dsl::commission_percentage.eq(terms.commission_percentage.to_string())))
            .execute(conn)?;

          // Reemplazo total del calendario: se vacían las dos tablas del
          // grupo y se reinsertan fechas y líneas desde cero.
          diesel::sql_query(format!("DELETE FROM {} WHERE group_id = ?", tables.chit_dates))
            .bind::<BigInt, _>(id)
            .execute(conn)?;
          diesel::sql_query(format!("DELETE FROM {} WHERE group_id = ?", tables.subscriptions))
            .bind::<BigInt, _>(id)
            .execute(conn)?;

          let mut sorted = chit_dates.clone();
          sorted.sort_by_key(|d| d.chit_date);
          let mut bids: BTreeMap<i32, Decimal> = BTreeMap::new();
          for (idx, d) in sorted.iter().enumerate() {
            // La i-ésima fecha programada corresponde al mes i+1.
            bids.insert(idx as i32 + 1, d.minimum_bid);
            diesel::sql_query(format!("INSERT INTO {} (group_id, chit_date, minimum_bid_cents) VALUES (?, ?, ?)",
                                      tables.chit_dates))
              .bind::<BigInt, _>(id)
              .bind::<Text, _>(d.chit_date.to_string())
              .bind::<BigInt, _>(to_cents(d.minimum_bid)?)
              .execute(conn)?;
          }
          for line in build_schedule(&terms, &bids)? {
            diesel::sql_query(format!("INSERT INTO {} (group_id, month_number, bid_amount_cents, \
                                       total_dividend_cents, distributed_dividend_cents, \
                                       monthly_subscription_cents) VALUES (?, ?, ?, ?, ?, ?)",
                                      tables.subscriptions))
              .bind::<BigInt, _>(id)
              .bind::<Integer, _>(line.month_number)
              .bind::<BigInt, _>(to_cents(line.bid_amount)?)
              .bind::<BigInt, _>(to_cents(line.total_dividend)?)
              .bind::<BigInt, _>(to_cents(line.distributed_dividend)?)
              .bind::<BigInt, _>(to_cents(line.monthly_subscription)?)
              .execute(conn)?;
          }
          row_to_group(GroupRow { total_amount_cents: total_cents,
                                  member_count: terms.member_count,
                                  number_of_months: terms.number_of_months,
                                  commission_percentage: terms.commission_percentage.to_string(),
                                  ..row }).map_err(TxError::from)
        })
  }

  fn set_group_status(&self, id: i64, status: GroupStatus) -> Result<()> {
    self.tx(|conn| {
          let updated =
            diesel::update(groups_dsl::groups.find(id)).set(groups_dsl::status.eq(status.as_str())).execute(conn)?;
          if updated == 0 {
            return Err(DomainError::NotFound(format!("grupo {}", id)).into());
          }
          Ok(())
        })
  }

  fn delete_group(&self, id: i64) -> Result<()> {
    self.tx(|conn| {
          let row = load_group_row(conn, id)?;
          provisioner::drop_group_tables(conn, row.id, &row.name)?;
          diesel::delete(groups_dsl::groups.find(id)).execute(conn)?;
          Ok(())
        })
  }

  fn group_tables(&self, id: i64) -> Result<GroupTableSet> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, id)?;
    Ok(GroupTableSet::new(row.id, &row.name))
  }

  fn add_group_member(&self, group_id: i64, member_id: i64, group_member_id: &str) -> Result<GroupMember> {
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          if !member_exists(conn, member_id)? {
            return Err(DomainError::NotFound(format!("socio {}", member_id)).into());
          }
          let tables = GroupTableSet::new(row.id, &row.name);
          diesel::sql_query(format!("INSERT INTO {} (group_id, member_id, group_member_id) VALUES (?, ?, ?)",
                                    tables.members))
            .bind::<BigInt, _>(group_id)
            .bind::<BigInt, _>(member_id)
            .bind::<Text, _>(group_member_id)
            .execute(conn)?;
          let id = last_insert_rowid(conn)?;
          Ok(GroupMember { id, group_id, member_id, group_member_id: group_member_id.to_string() })
        })
  }

  fn remove_group_member(&self, group_id: i64, member_id: i64) -> Result<()> {
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          let deleted = diesel::sql_query(format!("DELETE FROM {} WHERE group_id = ? AND member_id = ?", tables.members))
            .bind::<BigInt, _>(group_id)
            .bind::<BigInt, _>(member_id)
            .execute(conn)?;
          if deleted == 0 {
            return Err(DomainError::NotFound(format!("socio {} en grupo {}", member_id, group_id)).into());
          }
          Ok(())
        })
  }

  fn list_group_members(&self, group_id: i64) -> Result<Vec<GroupMember>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.members)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT id, group_id, member_id, group_member_id FROM {} ORDER BY id", tables.members);
    let rows = diesel::sql_query(sql).load::<GroupMemberRow>(&mut conn).map_err(map_db_err)?;
    Ok(rows.into_iter()
           .map(|r| GroupMember { id: r.id,
                                  group_id: r.group_id,
                                  member_id: r.member_id,
                                  group_member_id: r.group_member_id })
           .collect())
  }

  fn list_chit_dates(&self, group_id: i64) -> Result<Vec<ChitDate>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.chit_dates)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT id, group_id, chit_date, minimum_bid_cents FROM {} ORDER BY chit_date", tables.chit_dates);
    let rows = diesel::sql_query(sql).load::<ChitDateRow>(&mut conn).map_err(map_db_err)?;
    rows.into_iter()
        .map(|r| {
          Ok(ChitDate { id: r.id,
                        group_id: r.group_id,
                        chit_date: parse_stored_date(&r.chit_date)?,
                        minimum_bid: from_cents(r.minimum_bid_cents) })
        })
        .collect()
  }

  fn get_schedule(&self, group_id: i64) -> Result<Vec<SubscriptionLine>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.subscriptions)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT month_number, bid_amount_cents, total_dividend_cents, distributed_dividend_cents, \
                       monthly_subscription_cents FROM {} ORDER BY month_number",
                      tables.subscriptions);
    let rows = diesel::sql_query(sql).load::<SubscriptionRow>(&mut conn).map_err(map_db_err)?;
    Ok(rows.into_iter()
           .map(|r| SubscriptionLine { month_number: r.month_number,
                                       bid_amount: from_cents(r.bid_amount_cents),
                                       total_dividend: from_cents(r.total_dividend_cents),
                                       distributed_dividend: from_cents(r.distributed_dividend_cents),
                                       monthly_subscription: from_cents(r.monthly_subscription_cents) })
           .collect())
  }

  fn record_collection(&self,
                       group_id: i64,
                       member_id: i64,
                       installment: i32,
                       amount: Decimal,
                       date: chrono::NaiveDate)
                       -> Result<CollectionEvent> {
    validate_collection_amount(amount)?;
    let amount_cents = to_cents(amount)?;
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          if installment < 0 || installment > row.number_of_months {
            return Err(DomainError::Validation(format!("período {} fuera de 0..={}", installment,
                                                       row.number_of_months)).into());
          }
          if !member_exists(conn, member_id)? {
            return Err(DomainError::NotFound(format!("socio {}", member_id)).into());
          }
          let tables = GroupTableSet::new(row.id, &row.name);
          let due = due_cents_for(conn, &row, &tables, installment)?;
          let prior = load_balance_state(conn, &tables.balance, member_id, installment)?;
          let existed = prior.is_some();
          let next = prior.unwrap_or_else(|| BalanceState::open(from_cents(due))).apply_delta(from_cents(amount_cents));
          write_balance_state(conn, &tables.balance, group_id, member_id, installment, &next, existed)?;

          diesel::sql_query(format!("INSERT INTO {} (collection_date, group_id, member_id, installment_number, \
                                     collection_amount_cents, remaining_balance_cents, is_completed) \
                                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                                    tables.collection))
            .bind::<Text, _>(date.to_string())
            .bind::<BigInt, _>(group_id)
            .bind::<BigInt, _>(member_id)
            .bind::<Integer, _>(installment)
            .bind::<BigInt, _>(amount_cents)
            .bind::<BigInt, _>(to_cents(next.remaining_balance)?)
            .bind::<Bool, _>(next.is_completed)
            .execute(conn)?;
          let id = last_insert_rowid(conn)?;
          Ok(CollectionEvent { id,
                               group_id,
                               member_id,
                               installment_number: installment,
                               amount: from_cents(amount_cents),
                               collection_date: date,
                               remaining_balance: next.remaining_balance,
                               is_completed: next.is_completed })
        })
  }

  fn edit_collection(&self, group_id: i64, collection_id: i64, new_amount: Decimal) -> Result<CollectionEvent> {
    validate_collection_amount(new_amount)?;
    let new_cents = to_cents(new_amount)?;
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          let ev = load_collection(conn, &tables.collection, collection_id)?
            .ok_or_else(|| DomainError::NotFound(format!("cobro {}", collection_id)))?;
          // El delta se aplica a la clave (socio, período) guardada en el
          // apunte, nunca a la de la petición.
          let state = load_balance_state(conn, &tables.balance, ev.member_id, ev.installment_number)?
            .ok_or_else(|| DomainError::Storage(format!("saldo ausente para el cobro {}", collection_id)))?;
          let next = state.apply_delta(from_cents(new_cents - ev.collection_amount_cents));
          write_balance_state(conn, &tables.balance, group_id, ev.member_id, ev.installment_number, &next, true)?;

          diesel::sql_query(format!("UPDATE {} SET collection_amount_cents = ?, remaining_balance_cents = ?, \
                                     is_completed = ? WHERE id = ?",
                                    tables.collection))
            .bind::<BigInt, _>(new_cents)
            .bind::<BigInt, _>(to_cents(next.remaining_balance)?)
            .bind::<Bool, _>(next.is_completed)
            .bind::<BigInt, _>(collection_id)
            .execute(conn)?;
          Ok(CollectionEvent { id: ev.id,
                               group_id: ev.group_id,
                               member_id: ev.member_id,
                               installment_number: ev.installment_number,
                               amount: from_cents(new_cents),
                               collection_date: parse_stored_date(&ev.collection_date)?,
                               remaining_balance: next.remaining_balance,
                               is_completed: next.is_completed })
        })
  }

  fn delete_collection(&self, group_id: i64, collection_id: i64) -> Result<()> {
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          let ev = load_collection(conn, &tables.collection, collection_id)?
            .ok_or_else(|| DomainError::NotFound(format!("cobro {}", collection_id)))?;
          // Primero la reversión sobre el saldo, después el borrado del
          // apunte: al revés no quedaría nada que revertir.
          let state = load_balance_state(conn, &tables.balance, ev.member_id, ev.installment_number)?
            .ok_or_else(|| DomainError::Storage(format!("saldo ausente para el cobro {}", collection_id)))?;
          let next = state.apply_delta(from_cents(-ev.collection_amount_cents));
          write_balance_state(conn, &tables.balance, group_id, ev.member_id, ev.installment_number, &next, true)?;
          diesel::sql_query(format!("DELETE FROM {} WHERE id = ?", tables.collection))
            .bind::<BigInt, _>(collection_id)
            .execute(conn)?;
          Ok(())
        })
  }

  fn get_collection(&self, group_id: i64, collection_id: i64) -> Result<Option<CollectionEvent>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.collection)? {
      return Ok(None);
    }
    load_collection(&mut conn, &tables.collection, collection_id)?.map(row_to_collection).transpose()
  }

  fn list_collections(&self, group_id: i64) -> Result<Vec<CollectionEvent>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.collection)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT id, collection_date, group_id, member_id, installment_number, \
                       collection_amount_cents, remaining_balance_cents, is_completed FROM {} ORDER BY id",
                      tables.collection);
    let rows = diesel::sql_query(sql).load::<CollectionRow>(&mut conn).map_err(map_db_err)?;
    rows.into_iter().map(row_to_collection).collect()
  }

  fn list_balances(&self, group_id: i64) -> Result<Vec<BalanceRecord>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.balance)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT group_id, member_id, installment_number, total_paid_cents, remaining_balance_cents, \
                       is_completed, export_month_number, is_exported FROM {} \
                       ORDER BY member_id, installment_number",
                      tables.balance);
    let rows = diesel::sql_query(sql).load::<BalanceRow>(&mut conn).map_err(map_db_err)?;
    Ok(rows.into_iter().map(row_to_balance).collect())
  }

  fn customer_sheet(&self, group_id: i64) -> Result<Vec<CustomerSheetRow>> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.balance)? {
      return Ok(Vec::new());
    }
    let sql = format!("SELECT m.id AS member_id, m.name AS member_name, cb.installment_number, \
                       cb.total_paid_cents, cb.remaining_balance_cents, cb.is_completed \
                       FROM members m JOIN {} cb ON m.id = cb.member_id \
                       WHERE cb.group_id = ? ORDER BY m.id, cb.installment_number",
                      tables.balance);
    let rows = diesel::sql_query(sql).bind::<BigInt, _>(group_id)
                                     .load::<SheetRow>(&mut conn)
                                     .map_err(map_db_err)?;
    let mut sheet: Vec<CustomerSheetRow> = Vec::new();
    for r in rows {
      if sheet.last().map(|s| s.member_id) != Some(r.member_id) {
        sheet.push(CustomerSheetRow { member_id: r.member_id,
                                      member_name: r.member_name.clone(),
                                      installments: Vec::new(),
                                      installment_summary: String::new() });
      }
      if let Some(current) = sheet.last_mut() {
        current.installments.push(InstallmentBalance { installment_number: r.installment_number,
                                                       total_paid: from_cents(r.total_paid_cents),
                                                       remaining_balance: from_cents(r.remaining_balance_cents),
                                                       is_completed: r.is_completed });
      }
    }
    for s in sheet.iter_mut() {
      let pairs: Vec<(i32, bool)> = s.installments.iter().map(|i| (i.installment_number, i.is_completed)).collect();
      s.installment_summary = installment_summary(&pairs);
    }
    Ok(sheet)
  }

  fn is_month_exported(&self, group_id: i64, month: i32) -> Result<bool> {
    let mut conn = self.conn()?;
    let row = load_group_row(&mut conn, group_id)?;
    let tables = GroupTableSet::new(row.id, &row.name);
    if !provisioner::table_exists(&mut conn, &tables.balance)? {
      return Ok(false);
    }
    provisioner::ensure_export_columns(&mut conn, &tables.balance)?;
    let sql = format!("SELECT 1 AS present FROM {} WHERE export_month_number = ? AND is_exported = 1 LIMIT 1",
                      tables.balance);
    let found = diesel::sql_query(sql).bind::<Integer, _>(month)
                                      .get_result::<PresenceRow>(&mut conn)
                                      .optional()
                                      .map_err(map_db_err)?;
    Ok(found.is_some())
  }

  fn export_month(&self, group_id: i64, month: i32) -> Result<()> {
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          provisioner::ensure_export_columns(conn, &tables.balance)?;
          let due = due_cents_for(conn, &row, &tables, month)?;
          let member_rows = diesel::sql_query(format!("SELECT id, group_id, member_id, group_member_id FROM {}",
                                                      tables.members)).load::<GroupMemberRow>(conn)?;
          for m in member_rows {
            // Crea-o-marca: si la fila no existe se siembra sin pagos; si
            // existe sólo cambian las marcas de exportación. Repetir la
            // llamada deja el mismo estado.
            diesel::sql_query(format!("INSERT INTO {} (group_id, member_id, installment_number, total_paid_cents, \
                                       remaining_balance_cents, is_completed, export_month_number, is_exported) \
                                       VALUES (?, ?, ?, 0, ?, ?, ?, 1) \
                                       ON CONFLICT(group_id, member_id, installment_number) \
                                       DO UPDATE SET export_month_number = excluded.export_month_number, \
                                       is_exported = 1",
                                      tables.balance))
              .bind::<BigInt, _>(group_id)
              .bind::<BigInt, _>(m.member_id)
              .bind::<Integer, _>(month)
              .bind::<BigInt, _>(due)
              .bind::<Bool, _>(due <= 0)
              .bind::<Integer, _>(month)
              .execute(conn)?;
          }
          Ok(())
        })
  }

  fn reset_month_export(&self, group_id: i64, month: i32) -> Result<()> {
    self.tx(|conn| {
          let row = load_group_row(conn, group_id)?;
          let tables = GroupTableSet::new(row.id, &row.name);
          provisioner::ensure_export_columns(conn, &tables.balance)?;
          diesel::sql_query(format!("UPDATE {} SET export_month_number = NULL, is_exported = 0 \
                                     WHERE export_month_number = ?",
                                    tables.balance))
            .bind::<Integer, _>(month)
            .execute(conn)?;
          Ok(())
        })
  }
}
