// models.rs
use crate::errors::{DomainError, Result};
use crate::schedule::GroupTerms;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Estado de un socio del fondo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
  Active,
  Inactive,
}

impl MemberStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      MemberStatus::Active => "active",
      MemberStatus::Inactive => "inactive",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "active" => Ok(MemberStatus::Active),
      "inactive" => Ok(MemberStatus::Inactive),
      other => Err(DomainError::Validation(format!("estado de socio desconocido: {}", other))),
    }
  }
}

impl fmt::Display for MemberStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Socio registrado de forma independiente de cualquier grupo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
  pub id: i64,
  pub name: String,
  pub phone: Option<String>,
  pub address: Option<String>,
  pub email: Option<String>,
  pub status: MemberStatus,
}

/// Datos de alta/edición de un socio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMember {
  pub name: String,
  pub phone: Option<String>,
  pub address: Option<String>,
  pub email: Option<String>,
}

impl NewMember {
  pub fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(DomainError::Validation("el nombre del socio no puede estar vacío".to_string()));
    }
    Ok(())
  }
}

/// Estado del grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
  Active,
  Closed,
}

impl GroupStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      GroupStatus::Active => "active",
      GroupStatus::Closed => "closed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "active" => Ok(GroupStatus::Active),
      "closed" => Ok(GroupStatus::Closed),
      other => Err(DomainError::Validation(format!("estado de grupo desconocido: {}", other))),
    }
  }
}

impl fmt::Display for GroupStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Grupo (tanda): fondo rotatorio de duración fija. Posee una familia de
/// tablas físicas derivadas de (id, nombre); ver `crate::tables`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
  pub id: i64,
  pub name: String,
  pub total_amount: Decimal,
  pub member_count: i32,
  pub start_date: NaiveDate,
  pub end_date: NaiveDate,
  pub number_of_months: i32,
  pub commission_percentage: Decimal,
  pub status: GroupStatus,
}

impl Group {
  /// Términos económicos del grupo, únicos dueños de la comisión (la
  /// comisión por defecto se aplica una sola vez, al crear el grupo).
  pub fn terms(&self) -> GroupTerms {
    GroupTerms { total_amount: self.total_amount,
                 member_count: self.member_count,
                 number_of_months: self.number_of_months,
                 commission_percentage: self.commission_percentage }
  }
}

/// Datos de alta de un grupo. `commission_percentage == None` aplica el 4%
/// por defecto en el alta; después la fila del grupo es la única fuente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
  pub name: String,
  pub total_amount: Decimal,
  pub member_count: i32,
  pub start_date: NaiveDate,
  pub end_date: NaiveDate,
  pub number_of_months: i32,
  pub commission_percentage: Option<Decimal>,
}

/// Comisión por defecto (%) cuando el alta no la especifica.
pub const DEFAULT_COMMISSION_PERCENTAGE: Decimal = Decimal::from_parts(4, 0, 0, false, 0);

/// Inscripción de un socio en un grupo. `group_member_id` es la etiqueta de
/// secuencia asignada por el operador dentro del grupo (no es el id del
/// socio). Única por (grupo, socio).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
  pub id: i64,
  pub group_id: i64,
  pub member_id: i64,
  pub group_member_id: String,
}

/// Fecha programada de un período con su puja mínima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChitDate {
  pub id: i64,
  pub group_id: i64,
  pub chit_date: NaiveDate,
  pub minimum_bid: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChitDate {
  pub chit_date: NaiveDate,
  pub minimum_bid: Decimal,
}

/// Línea calculada del calendario de suscripciones (un mes 0..=N).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionLine {
  pub month_number: i32,
  pub bid_amount: Decimal,
  pub total_dividend: Decimal,
  pub distributed_dividend: Decimal,
  pub monthly_subscription: Decimal,
}

/// Cobro registrado: apunte inmutable del diario con la instantánea del
/// saldo resultante.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
  pub id: i64,
  pub group_id: i64,
  pub member_id: i64,
  pub installment_number: i32,
  pub amount: Decimal,
  pub collection_date: NaiveDate,
  pub remaining_balance: Decimal,
  pub is_completed: bool,
}

/// Fila del libro de saldos, una por (grupo, socio, período).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
  pub group_id: i64,
  pub member_id: i64,
  pub installment_number: i32,
  pub total_paid: Decimal,
  pub remaining_balance: Decimal,
  pub is_completed: bool,
  pub export_month_number: Option<i32>,
  pub is_exported: bool,
}

/// Saldo de un período dentro de la hoja de cliente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentBalance {
  pub installment_number: i32,
  pub total_paid: Decimal,
  pub remaining_balance: Decimal,
  pub is_completed: bool,
}

/// Fila de la hoja de cliente: saldos de un socio más el resumen compacto
/// de períodos ("1c,2" = período 1 completado, período 2 abierto).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerSheetRow {
  pub member_id: i64,
  pub member_name: String,
  pub installments: Vec<InstallmentBalance>,
  pub installment_summary: String,
}
