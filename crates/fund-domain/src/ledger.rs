// Archivo: ledger.rs
// Propósito: máquina de estados pura del libro de saldos. Tanto el
// repositorio en memoria como el de Diesel delegan aquí la aritmética, de
// modo que la conservación del dinero tiene una única implementación.
//
// Estados por (grupo, socio, período):
//   Sin abrir (no hay fila) -> Abierto (total_paid < cuota) ->
//   Completado (remaining_balance <= 0). Sólo una edición/borrado que
//   reduzca total_paid vuelve a Abierto, recalculando is_completed.
use crate::errors::{DomainError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Saldo vivo de un período: lo pagado, lo pendiente y el indicador de
/// completado. Invariante: `remaining_balance = cuota − total_paid` y
/// `is_completed ⇔ remaining_balance <= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceState {
  pub total_paid: Decimal,
  pub remaining_balance: Decimal,
  pub is_completed: bool,
}

impl BalanceState {
  /// Abre el período con cuota `due` y nada pagado.
  pub fn open(due: Decimal) -> Self {
    Self::recompute(due, Decimal::ZERO)
  }

  /// Reconstruye el estado desde la cuota y el total pagado, recalculando
  /// siempre `is_completed` (nunca se arrastra un valor viejo).
  pub fn recompute(due: Decimal, total_paid: Decimal) -> Self {
    let remaining = due - total_paid;
    Self { total_paid, remaining_balance: remaining, is_completed: remaining <= Decimal::ZERO }
  }

  /// Cuota implícita del período (pagado + pendiente). Se conserva bajo
  /// cualquier secuencia de `apply_delta`.
  pub fn due(&self) -> Decimal {
    self.total_paid + self.remaining_balance
  }

  /// Aplica un delta de pago (positivo al cobrar, negativo al revertir) y
  /// devuelve el nuevo estado.
  pub fn apply_delta(&self, delta: Decimal) -> Self {
    Self::recompute(self.due(), self.total_paid + delta)
  }
}

/// Valida un importe de cobro: debe ser estrictamente positivo.
pub fn validate_collection_amount(amount: Decimal) -> Result<()> {
  if amount <= Decimal::ZERO {
    return Err(DomainError::Validation(format!("el importe del cobro debe ser positivo: {}", amount)));
  }
  Ok(())
}

/// Resumen compacto de períodos de un socio para la hoja del cobrador.
///
/// Entrada: pares (período, completado) ya ordenados por período. Los
/// períodos consecutivos con el mismo estado se agrupan en rangos y los
/// completados llevan el sufijo `c`: `[(1,true),(2,false)]` -> `"1c,2"`,
/// `[(1,true),(2,true),(3,true),(5,false)]` -> `"1-3c,5"`.
pub fn installment_summary(installments: &[(i32, bool)]) -> String {
  let mut parts: Vec<String> = Vec::new();
  let mut i = 0;
  while i < installments.len() {
    let (start, completed) = installments[i];
    let mut end = start;
    while i + 1 < installments.len() && installments[i + 1].0 == end + 1 && installments[i + 1].1 == completed {
      i += 1;
      end = installments[i].0;
    }
    let suffix = if completed { "c" } else { "" };
    if start == end {
      parts.push(format!("{}{}", start, suffix));
    } else {
      parts.push(format!("{}-{}{}", start, end, suffix));
    }
    i += 1;
  }
  parts.join(",")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn due() -> Decimal {
    Decimal::from(10_000)
  }

  #[test]
  fn open_then_partial_payment() {
    // Escenario B: cobro de 3000 sobre un período sin abrir con cuota 10000.
    let state = BalanceState::open(due()).apply_delta(Decimal::from(3_000));
    assert_eq!(state.total_paid, Decimal::from(3_000));
    assert_eq!(state.remaining_balance, Decimal::from(7_000));
    assert!(!state.is_completed);
  }

  #[test]
  fn edit_to_full_amount_completes() {
    // Escenario C: editar ese cobro de 3000 a 10000 (delta +7000).
    let state = BalanceState::open(due()).apply_delta(Decimal::from(3_000)).apply_delta(Decimal::from(7_000));
    assert_eq!(state.total_paid, Decimal::from(10_000));
    assert_eq!(state.remaining_balance, Decimal::ZERO);
    assert!(state.is_completed);
  }

  #[test]
  fn delete_reverses_back_to_open() {
    // Escenario D: borrar el cobro revierte el importe completo.
    let paid = BalanceState::open(due()).apply_delta(Decimal::from(10_000));
    assert!(paid.is_completed);
    let reversed = paid.apply_delta(Decimal::from(-10_000));
    assert_eq!(reversed.total_paid, Decimal::ZERO);
    assert_eq!(reversed.remaining_balance, due());
    assert!(!reversed.is_completed);
  }

  #[test]
  fn due_is_conserved_under_any_delta_sequence() {
    let mut state = BalanceState::open(due());
    for delta in [3_000, 2_500, -1_000, 5_500, -4_000] {
      state = state.apply_delta(Decimal::from(delta));
      assert_eq!(state.due(), due());
      assert_eq!(state.is_completed, state.remaining_balance <= Decimal::ZERO);
    }
  }

  #[test]
  fn overpayment_is_completed_with_negative_remaining() {
    let state = BalanceState::open(due()).apply_delta(Decimal::from(12_000));
    assert_eq!(state.remaining_balance, Decimal::from(-2_000));
    assert!(state.is_completed);
  }

  #[test]
  fn rejects_non_positive_amounts() {
    assert!(validate_collection_amount(Decimal::ZERO).is_err());
    assert!(validate_collection_amount(Decimal::from(-5)).is_err());
    assert!(validate_collection_amount(Decimal::from(1)).is_ok());
  }

  #[test]
  fn summary_groups_consecutive_runs() {
    assert_eq!(installment_summary(&[]), "");
    assert_eq!(installment_summary(&[(1, true), (2, false)]), "1c,2");
    assert_eq!(installment_summary(&[(1, true), (2, true), (3, true), (5, false)]), "1-3c,5");
    assert_eq!(installment_summary(&[(0, false), (1, false), (2, true), (4, true)]), "0-1,2c,4c");
  }
}
