// Archivo: retry.rs
// Propósito: política única de reintentos ante SQLITE_BUSY. Sustituye a los
// envoltorios ad hoc por llamada: el repositorio aplica esta política a cada
// transacción completa, con una conexión fresca del pool en cada intento.
use fund_domain::{DomainError, Result};
use std::time::Duration;

/// Backoff exponencial acotado: sólo reintenta `DomainError::Busy`; el resto
/// de errores se propaga al primer fallo.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    // Mismo presupuesto que el backend original: 3 intentos desde 100 ms.
    Self { max_attempts: 3, initial_delay: Duration::from_millis(100) }
  }
}

impl RetryPolicy {
  pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where F: FnMut() -> Result<T>
  {
    let mut delay = self.initial_delay;
    let mut last = DomainError::Busy("sin intentos".to_string());
    for attempt in 1..=self.max_attempts.max(1) {
      match op() {
        Err(DomainError::Busy(msg)) => {
          last = DomainError::Busy(msg);
          if attempt < self.max_attempts {
            log::warn!("base de datos ocupada, reintento {}/{} en {:?}", attempt, self.max_attempts, delay);
            std::thread::sleep(delay);
            delay *= 2;
          }
        }
        other => return other,
      }
    }
    Err(last)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  fn fast_policy() -> RetryPolicy {
    RetryPolicy { max_attempts: 3, initial_delay: Duration::from_millis(1) }
  }

  #[test]
  fn retries_busy_until_success() {
    let calls = Cell::new(0u32);
    let result = fast_policy().run(|| {
                                calls.set(calls.get() + 1);
                                if calls.get() < 3 {
                                  Err(DomainError::Busy("database is locked".to_string()))
                                } else {
                                  Ok(42)
                                }
                              });
    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.get(), 3);
  }

  #[test]
  fn gives_up_after_budget() {
    let calls = Cell::new(0u32);
    let result: Result<()> = fast_policy().run(|| {
                                            calls.set(calls.get() + 1);
                                            Err(DomainError::Busy("database is locked".to_string()))
                                          });
    assert!(matches!(result, Err(DomainError::Busy(_))));
    assert_eq!(calls.get(), 3);
  }

  #[test]
  fn non_busy_errors_are_not_retried() {
    let calls = Cell::new(0u32);
    let result: Result<()> = fast_policy().run(|| {
                                            calls.set(calls.get() + 1);
                                            Err(DomainError::NotFound("grupo 9".to_string()))
                                          });
    assert!(matches!(result, Err(DomainError::NotFound(_))));
    assert_eq!(calls.get(), 1);
  }
}
