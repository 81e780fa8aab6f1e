//! Aritmética monetaria con `rust_decimal` para evitar deriva de punto
//! flotante. Todos los importes del dominio son `Decimal` con dos decimales;
//! la capa de persistencia los guarda como céntimos enteros (i64).

use crate::errors::{DomainError, Result};
use rust_decimal::prelude::*;

/// Decimales monetarios (2, redondeo half-up).
pub const DECIMAL_PLACES: u32 = 2;

/// Redondea un importe a dos decimales, medio punto alejándose de cero.
pub fn round_money(value: Decimal) -> Decimal {
  value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Convierte un importe a céntimos para almacenarlo. Rechaza valores que no
/// caben en i64 o que no son representables tras redondear.
pub fn to_cents(value: Decimal) -> Result<i64> {
  let scaled = round_money(value) * Decimal::from(100u32);
  scaled.to_i64()
        .ok_or_else(|| DomainError::Validation(format!("importe no representable en céntimos: {}", value)))
}

/// Reconstruye un `Decimal` de dos decimales desde céntimos.
pub fn from_cents(cents: i64) -> Decimal {
  Decimal::new(cents, DECIMAL_PLACES)
}
