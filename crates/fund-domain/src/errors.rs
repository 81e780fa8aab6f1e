// Archivo: errors.rs
// Propósito: definir los errores del dominio del fondo (chit fund) y el alias
// Result<T> usado por las APIs del crate.
use thiserror::Error;

/// Errores comunes del dominio del fondo.
///
/// - `NotFound`: grupo/socio/cobro inexistente; no se reintenta.
/// - `Busy`: contención transitoria del almacenamiento (SQLITE_BUSY);
///   se reintenta localmente con backoff acotado antes de propagarse.
/// - `Constraint`: violación de unicidad o de clave foránea.
/// - `Validation`: entrada malformada o aritmética inconsistente.
/// - `Provisioning`: fallo creando/eliminando las tablas por grupo.
/// - `Storage`: cualquier otro error del almacenamiento externo.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
  /// Entidad no encontrada (grupo, socio, cobro).
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// Base de datos ocupada/bloqueada; transitorio.
  #[error("Almacenamiento ocupado: {0}")]
  Busy(String),
  /// Violación de restricción (UNIQUE, FOREIGN KEY, colisión de nombres).
  #[error("Restricción violada: {0}")]
  Constraint(String),
  /// Error de validación de entrada o de aritmética.
  #[error("Error de validación: {0}")]
  Validation(String),
  /// Fallo de aprovisionamiento de tablas por grupo.
  #[error("Error de aprovisionamiento: {0}")]
  Provisioning(String),
  /// Error genérico de almacenamiento (BD, pool, etc.).
  #[error("Error de almacenamiento: {0}")]
  Storage(String),
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, DomainError>;
