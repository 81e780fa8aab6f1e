// Archivo: tables.rs
// Propósito: registro de esquema por grupo. Deriva de forma determinista los
// nombres de las cinco tablas propias de un grupo a partir de (id, nombre).
use serde::{Deserialize, Serialize};
use std::fmt;

/// Los cinco tipos de tabla que posee cada grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
  Collection,
  CollectionBalance,
  GroupMembers,
  ChitDates,
  MonthlySubscription,
}

impl TableKind {
  pub const ALL: [TableKind; 5] = [TableKind::Collection,
                                   TableKind::CollectionBalance,
                                   TableKind::GroupMembers,
                                   TableKind::ChitDates,
                                   TableKind::MonthlySubscription];

  /// Prefijo fijo usado en el nombre físico de la tabla.
  pub fn prefix(&self) -> &'static str {
    match self {
      TableKind::Collection => "collection",
      TableKind::CollectionBalance => "collection_balance",
      TableKind::GroupMembers => "group_members",
      TableKind::ChitDates => "chit_dates",
      TableKind::MonthlySubscription => "monthly_subscription",
    }
  }
}

impl fmt::Display for TableKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.prefix())
  }
}

/// Normaliza el nombre de un grupo para usarlo en nombres de tabla:
/// minúsculas y sólo `[a-z0-9]`. Dos nombres distintos pueden colisionar
/// tras normalizar; la creación/renombrado de grupos debe rechazar esa
/// colisión (ver `FundRepository::create_group`).
pub fn sanitize_group_name(name: &str) -> String {
  name.chars()
      .filter(|c| c.is_ascii_alphanumeric())
      .map(|c| c.to_ascii_lowercase())
      .collect()
}

/// Nombre físico de la tabla `kind` del grupo `(group_id, group_name)`.
/// Función pura y determinista: `{prefijo}_{id}_{nombre_normalizado}`.
pub fn table_name(group_id: i64, group_name: &str, kind: TableKind) -> String {
  format!("{}_{}_{}", kind.prefix(), group_id, sanitize_group_name(group_name))
}

/// Conjunto resuelto de tablas de un grupo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTableSet {
  pub collection: String,
  pub balance: String,
  pub members: String,
  pub chit_dates: String,
  pub subscriptions: String,
}

impl GroupTableSet {
  pub fn new(group_id: i64, group_name: &str) -> Self {
    Self { collection: table_name(group_id, group_name, TableKind::Collection),
           balance: table_name(group_id, group_name, TableKind::CollectionBalance),
           members: table_name(group_id, group_name, TableKind::GroupMembers),
           chit_dates: table_name(group_id, group_name, TableKind::ChitDates),
           subscriptions: table_name(group_id, group_name, TableKind::MonthlySubscription) }
  }

  /// Itera las cinco tablas en orden fijo (el mismo de `TableKind::ALL`).
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    [self.collection.as_str(),
     self.balance.as_str(),
     self.members.as_str(),
     self.chit_dates.as_str(),
     self.subscriptions.as_str()].into_iter()
  }
}
