// Archivo: schedule.rs
// Propósito: calculadora del calendario de suscripciones. A partir de los
// términos del grupo (bote total, número de socios, duración, % de comisión)
// produce una línea por mes 0..=N con puja, dividendo y suscripción neta.
use crate::errors::{DomainError, Result};
use crate::models::SubscriptionLine;
use crate::money::round_money;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Términos económicos de un grupo. La fila del grupo es la única fuente de
/// la comisión; aquí nunca se aplica un valor por defecto.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupTerms {
  pub total_amount: Decimal,
  pub member_count: i32,
  pub number_of_months: i32,
  pub commission_percentage: Decimal,
}

impl GroupTerms {
  pub fn validate(&self) -> Result<()> {
    if self.total_amount <= Decimal::ZERO {
      return Err(DomainError::Validation("el bote total debe ser positivo".to_string()));
    }
    if self.member_count <= 0 {
      return Err(DomainError::Validation("el número de socios debe ser positivo".to_string()));
    }
    if self.number_of_months <= 0 {
      return Err(DomainError::Validation("la duración en meses debe ser positiva".to_string()));
    }
    if self.commission_percentage < Decimal::ZERO || self.commission_percentage > Decimal::ONE_HUNDRED {
      return Err(DomainError::Validation("la comisión debe estar entre 0 y 100".to_string()));
    }
    Ok(())
  }

  /// Suscripción base: bote total / número de socios.
  pub fn base_subscription(&self) -> Decimal {
    round_money(self.total_amount / Decimal::from(self.member_count))
  }

  /// Comisión absoluta: bote total × C / 100.
  pub fn commission_amount(&self) -> Decimal {
    round_money(self.total_amount * self.commission_percentage / Decimal::ONE_HUNDRED)
  }
}

/// Calcula el calendario completo, meses 0..=N inclusive.
///
/// - Mes 0 y mes N: sin puja ni dividendo, suscripción = base.
/// - Mes interior i: puja = mínimo programado para i (o el bote total si no
///   hay); dividendo total = puja − comisión; dividendo repartido =
///   dividendo total / socios; suscripción = base − dividendo repartido.
///
/// El dividendo repartido puede superar la base y producir una suscripción
/// negativa; la calculadora no lo recorta. Es aritmética tal cual del
/// negocio y queda en manos del operador.
pub fn build_schedule(terms: &GroupTerms, minimum_bids: &BTreeMap<i32, Decimal>) -> Result<Vec<SubscriptionLine>> {
  terms.validate()?;
  let base = terms.base_subscription();
  let commission = terms.commission_amount();
  let members = Decimal::from(terms.member_count);
  let n = terms.number_of_months;

  let mut lines = Vec::with_capacity((n + 1) as usize);
  for month in 0..=n {
    if month == 0 || month == n {
      lines.push(SubscriptionLine { month_number: month,
                                    bid_amount: Decimal::ZERO,
                                    total_dividend: Decimal::ZERO,
                                    distributed_dividend: Decimal::ZERO,
                                    monthly_subscription: base });
      continue;
    }
    let bid = minimum_bids.get(&month).copied().unwrap_or(terms.total_amount);
    let total_dividend = round_money(bid - commission);
    let distributed_dividend = round_money(total_dividend / members);
    lines.push(SubscriptionLine { month_number: month,
                                  bid_amount: round_money(bid),
                                  total_dividend,
                                  distributed_dividend,
                                  monthly_subscription: round_money(base - distributed_dividend) });
  }
  Ok(lines)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn terms() -> GroupTerms {
    GroupTerms { total_amount: Decimal::from(120_000),
                 member_count: 12,
                 number_of_months: 12,
                 commission_percentage: Decimal::from(4) }
  }

  #[test]
  fn base_and_commission() {
    let t = terms();
    assert_eq!(t.base_subscription(), Decimal::from(10_000));
    assert_eq!(t.commission_amount(), Decimal::from(4_800));
  }

  #[test]
  fn first_and_last_month_use_flat_base() {
    let schedule = build_schedule(&terms(), &BTreeMap::new()).unwrap();
    assert_eq!(schedule.len(), 13);
    for line in [&schedule[0], &schedule[12]] {
      assert_eq!(line.bid_amount, Decimal::ZERO);
      assert_eq!(line.total_dividend, Decimal::ZERO);
      assert_eq!(line.distributed_dividend, Decimal::ZERO);
      assert_eq!(line.monthly_subscription, Decimal::from(10_000));
    }
  }

  #[test]
  fn interior_month_with_scheduled_bid() {
    let mut bids = BTreeMap::new();
    bids.insert(5, Decimal::from(60_000));
    let schedule = build_schedule(&terms(), &bids).unwrap();
    let line = &schedule[5];
    assert_eq!(line.bid_amount, Decimal::from(60_000));
    assert_eq!(line.total_dividend, Decimal::from(55_200));
    assert_eq!(line.distributed_dividend, Decimal::from(4_600));
    assert_eq!(line.monthly_subscription, Decimal::from(5_400));
  }

  #[test]
  fn interior_month_without_bid_falls_back_to_total_amount() {
    let schedule = build_schedule(&terms(), &BTreeMap::new()).unwrap();
    let line = &schedule[3];
    assert_eq!(line.bid_amount, Decimal::from(120_000));
    // 120000 - 4800 = 115200; 115200 / 12 = 9600; 10000 - 9600 = 400
    assert_eq!(line.monthly_subscription, Decimal::from(400));
  }

  #[test]
  fn dividend_above_base_yields_negative_subscription() {
    // Comisión 0 y puja al bote total: el dividendo repartido iguala la
    // base y la suscripción queda en cero. Sin recorte.
    let t = GroupTerms { total_amount: Decimal::from(120_000),
                         member_count: 10,
                         number_of_months: 12,
                         commission_percentage: Decimal::ZERO };
    let schedule = build_schedule(&t, &BTreeMap::new()).unwrap();
    let line = &schedule[4];
    assert_eq!(line.distributed_dividend, Decimal::from(12_000));
    assert_eq!(line.monthly_subscription, Decimal::ZERO);

    // Puja por encima del bote: dividendo repartido 13000 > base 12000.
    let mut bids = BTreeMap::new();
    bids.insert(4, Decimal::from(130_000));
    let schedule = build_schedule(&t, &bids).unwrap();
    assert_eq!(schedule[4].monthly_subscription, Decimal::from(-1_000));
  }

  #[test]
  fn rejects_malformed_terms() {
    let mut t = terms();
    t.member_count = 0;
    assert!(matches!(build_schedule(&t, &BTreeMap::new()), Err(DomainError::Validation(_))));
    let mut t = terms();
    t.commission_percentage = Decimal::from(150);
    assert!(matches!(build_schedule(&t, &BTreeMap::new()), Err(DomainError::Validation(_))));
  }
}
