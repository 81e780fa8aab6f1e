use crate::errors::{DomainError, Result};
use crate::ledger::{installment_summary, validate_collection_amount, BalanceState};
use crate::models::*;
use crate::schedule::{build_schedule, GroupTerms};
use crate::tables::{sanitize_group_name, GroupTableSet};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Contrato de persistencia del fondo. Lo implementan el repositorio Diesel
/// (SQLite) y el repositorio en memoria para tests y desarrollo.
///
/// Toda mutación del libro de saldos (cobrar, editar, borrar, exportar) es
/// atómica: el apunte del diario y la fila de saldo se confirman juntos o no
/// se confirma nada.
pub trait FundRepository: Send + Sync {
  // ---- socios ----
  /// Alta de un socio; devuelve la fila con id asignado.
  fn create_member(&self, member: NewMember) -> Result<Member>;
  fn get_member(&self, id: i64) -> Result<Option<Member>>;
  fn list_members(&self) -> Result<Vec<Member>>;
  /// Actualiza los datos y el estado de un socio.
  fn update_member(&self, id: i64, member: NewMember, status: MemberStatus) -> Result<Member>;
  /// Borra un socio. Falla con `Constraint` si está inscrito en algún grupo.
  fn delete_member(&self, id: i64) -> Result<()>;

  // ---- grupos y aprovisionamiento ----
  /// Crea el grupo y aprovisiona sus cinco tablas en la misma transacción.
  /// Rechaza con `Constraint` un nombre cuya forma normalizada colisione
  /// con la de un grupo existente.
  fn create_group(&self, group: NewGroup) -> Result<Group>;
  fn get_group(&self, id: i64) -> Result<Option<Group>>;
  fn list_groups(&self) -> Result<Vec<Group>>;
  /// Renombra el grupo conservando los datos: aprovisiona el juego de
  /// tablas nuevo, copia las filas y elimina el viejo, todo en una
  /// transacción.
  fn rename_group(&self, id: i64, new_name: &str) -> Result<Group>;
  /// Actualiza los términos y regenera el calendario completo (reemplazo
  /// total de fechas y suscripciones, nunca un parche).
  fn update_group_terms(&self, id: i64, terms: GroupTerms, chit_dates: Vec<NewChitDate>) -> Result<Group>;
  fn set_group_status(&self, id: i64, status: GroupStatus) -> Result<()>;
  /// Elimina el grupo y sus cinco tablas.
  fn delete_group(&self, id: i64) -> Result<()>;
  /// Nombres de tabla resueltos del grupo (re-derivables en todo momento).
  fn group_tables(&self, id: i64) -> Result<GroupTableSet>;

  // ---- inscripción ----
  /// Inscribe un socio con su etiqueta de secuencia. Única por
  /// (grupo, socio).
  fn add_group_member(&self, group_id: i64, member_id: i64, group_member_id: &str) -> Result<GroupMember>;
  fn remove_group_member(&self, group_id: i64, member_id: i64) -> Result<()>;
  fn list_group_members(&self, group_id: i64) -> Result<Vec<GroupMember>>;

  // ---- calendario ----
  fn list_chit_dates(&self, group_id: i64) -> Result<Vec<ChitDate>>;
  fn get_schedule(&self, group_id: i64) -> Result<Vec<SubscriptionLine>>;

  // ---- libro de cobros ----
  /// Registra un cobro: abre el saldo si no existe, inserta el apunte con
  /// la instantánea resultante y actualiza el saldo, atómicamente.
  fn record_collection(&self,
                       group_id: i64,
                       member_id: i64,
                       installment: i32,
                       amount: Decimal,
                       date: NaiveDate)
                       -> Result<CollectionEvent>;
  /// Cambia el importe de un cobro aplicando el delta al saldo del
  /// (socio, período) guardado en el apunte, nunca al de la petición.
  fn edit_collection(&self, group_id: i64, collection_id: i64, new_amount: Decimal) -> Result<CollectionEvent>;
  /// Revierte el importe sobre el saldo y después borra el apunte.
  fn delete_collection(&self, group_id: i64, collection_id: i64) -> Result<()>;
  fn get_collection(&self, group_id: i64, collection_id: i64) -> Result<Option<CollectionEvent>>;
  fn list_collections(&self, group_id: i64) -> Result<Vec<CollectionEvent>>;
  /// Saldos del grupo ordenados por socio y período. Un grupo desconocido
  /// es `NotFound`; si el grupo existe pero su tabla de saldos aún no, la
  /// lista es vacía.
  fn list_balances(&self, group_id: i64) -> Result<Vec<BalanceRecord>>;
  /// Hoja de cliente: saldos por socio con nombre y resumen compacto.
  fn customer_sheet(&self, group_id: i64) -> Result<Vec<CustomerSheetRow>>;

  // ---- exportación de pagos ----
  /// `true` si algún saldo del grupo quedó exportado para ese mes.
  fn is_month_exported(&self, group_id: i64, month: i32) -> Result<bool>;
  /// Marca el mes como exportado para todos los inscritos, sembrando los
  /// saldos que falten con total_paid = 0. Idempotente.
  fn export_month(&self, group_id: i64, month: i32) -> Result<()>;
  /// Limpia las marcas de exportación del mes. No hace nada si no había.
  fn reset_month_export(&self, group_id: i64, month: i32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Implementación en memoria para tests y desarrollo.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
  next_member_id: i64,
  next_group_id: i64,
  next_membership_id: i64,
  next_chit_date_id: i64,
  next_collection_id: i64,
  members: BTreeMap<i64, Member>,
  groups: BTreeMap<i64, Group>,
  memberships: Vec<GroupMember>,
  chit_dates: Vec<ChitDate>,
  schedules: HashMap<i64, Vec<SubscriptionLine>>,
  collections: Vec<CollectionEvent>,
  // Clave (grupo, socio, período): única por construcción.
  balances: BTreeMap<(i64, i64, i32), BalanceRecord>,
}

pub struct InMemoryFundRepository {
  state: Arc<Mutex<State>>,
}

impl InMemoryFundRepository {
  pub fn new() -> Self {
    Self { state: Arc::new(Mutex::new(State::default())) }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
    self.state
        .lock()
        .map_err(|e| DomainError::Storage(format!("Mutex del repositorio envenenado: {}", e)))
  }
}

impl Default for InMemoryFundRepository {
  fn default() -> Self {
    Self::new()
  }
}

impl State {
  fn group(&self, id: i64) -> Result<&Group> {
    self.groups.get(&id).ok_or_else(|| DomainError::NotFound(format!("grupo {}", id)))
  }

  /// Cuota del período: línea del calendario si existe, si no la base.
  fn due_for(&self, group: &Group, installment: i32) -> Decimal {
    self.schedules
        .get(&group.id)
        .and_then(|lines| lines.iter().find(|l| l.month_number == installment))
        .map(|l| l.monthly_subscription)
        .unwrap_or_else(|| group.terms().base_subscription())
  }

  fn check_name_collision(&self, name: &str, exclude_group: Option<i64>) -> Result<()> {
    let wanted = sanitize_group_name(name);
    if name.trim().is_empty() || wanted.is_empty() {
      return Err(DomainError::Validation("el nombre del grupo debe contener algún carácter alfanumérico".to_string()));
    }
    for g in self.groups.values() {
      if Some(g.id) != exclude_group && sanitize_group_name(&g.name) == wanted {
        return Err(DomainError::Constraint(format!("el nombre '{}' colisiona con el grupo '{}' tras normalizar",
                                                   name, g.name)));
      }
    }
    Ok(())
  }

  fn replace_schedule(&mut self, group_id: i64, terms: &GroupTerms, dates: Vec<NewChitDate>) -> Result<()> {
    // Reemplazo total: fuera las fechas y líneas anteriores del grupo.
    self.chit_dates.retain(|d| d.group_id != group_id);
    self.schedules.remove(&group_id);

    let mut sorted = dates;
    sorted.sort_by_key(|d| d.chit_date);
    let mut bids: BTreeMap<i32, Decimal> = BTreeMap::new();
    for (idx, d) in sorted.iter().enumerate() {
      // La i-ésima fecha programada corresponde al mes i+1.
      bids.insert(idx as i32 + 1, d.minimum_bid);
      self.next_chit_date_id += 1;
      self.chit_dates.push(ChitDate { id: self.next_chit_date_id,
                                      group_id,
                                      chit_date: d.chit_date,
                                      minimum_bid: d.minimum_bid });
    }
    let lines = build_schedule(terms, &bids)?;
    self.schedules.insert(group_id, lines);
    Ok(())
  }
}

impl FundRepository for InMemoryFundRepository {
  fn create_member(&self, member: NewMember) -> Result<Member> {
    member.validate()?;
    let mut s = self.lock()?;
    s.next_member_id += 1;
    let row = Member { id: s.next_member_id,
                       name: member.name,
                       phone: member.phone,
                       address: member.address,
                       email: member.email,
                       status: MemberStatus::Active };
    s.members.insert(row.id, row.clone());
    Ok(row)
  }

  fn get_member(&self, id: i64) -> Result<Option<Member>> {
    Ok(self.lock()?.members.get(&id).cloned())
  }

  fn list_members(&self) -> Result<Vec<Member>> {
    Ok(self.lock()?.members.values().cloned().collect())
  }

  fn update_member(&self, id: i64, member: NewMember, status: MemberStatus) -> Result<Member> {
    member.validate()?;
    let mut s = self.lock()?;
    let row = s.members.get_mut(&id).ok_or_else(|| DomainError::NotFound(format!("socio {}", id)))?;
    row.name = member.name;
    row.phone = member.phone;
    row.address = member.address;
    row.email = member.email;
    row.status = status;
    Ok(row.clone())
  }

  fn delete_member(&self, id: i64) -> Result<()> {
    let mut s = self.lock()?;
    if !s.members.contains_key(&id) {
      return Err(DomainError::NotFound(format!("socio {}", id)));
    }
    if s.memberships.iter().any(|m| m.member_id == id) {
      return Err(DomainError::Constraint(format!("no se puede borrar el socio {}; está inscrito en un grupo", id)));
    }
    s.members.remove(&id);
    Ok(())
  }

  fn create_group(&self, group: NewGroup) -> Result<Group> {
    let commission = group.commission_percentage.unwrap_or(DEFAULT_COMMISSION_PERCENTAGE);
    let terms = GroupTerms { total_amount: group.total_amount,
                             member_count: group.member_count,
                             number_of_months: group.number_of_months,
                             commission_percentage: commission };
    terms.validate()?;
    let mut s = self.lock()?;
    s.check_name_collision(&group.name, None)?;
    s.next_group_id += 1;
    let row = Group { id: s.next_group_id,
                      name: group.name,
                      total_amount: group.total_amount,
                      member_count: group.member_count,
                      start_date: group.start_date,
                      end_date: group.end_date,
                      number_of_months: group.number_of_months,
                      commission_percentage: commission,
                      status: GroupStatus::Active };
    s.groups.insert(row.id, row.clone());
    Ok(row)
  }

  fn get_group(&self, id: i64) -> Result<Option<Group>> {
    Ok(self.lock()?.groups.get(&id).cloned())
  }

  fn list_groups(&self) -> Result<Vec<Group>> {
    Ok(self.lock()?.groups.values().cloned().collect())
  }

  fn rename_group(&self, id: i64, new_name: &str) -> Result<Group> {
    let mut s = self.lock()?;
    s.check_name_collision(new_name, Some(id))?;
    let row = s.groups.get_mut(&id).ok_or_else(|| DomainError::NotFound(format!("grupo {}", id)))?;
    // En memoria los datos viven indexados por id, así que el renombrado
    // conserva todo; el repo Diesel copia las filas al juego nuevo.
    row.name = new_name.to_string();
    Ok(row.clone())
  }

  fn update_group_terms(&self, id: i64, terms: GroupTerms, chit_dates: Vec<NewChitDate>) -> Result<Group> {
    terms.validate()?;
    let mut s = self.lock()?;
    s.group(id)?;
    s.replace_schedule(id, &terms, chit_dates)?;
    let row = s.groups.get_mut(&id).ok_or_else(|| DomainError::NotFound(format!("grupo {}", id)))?;
    row.total_amount = terms.total_amount;
    row.member_count = terms.member_count;
    row.number_of_months = terms.number_of_months;
    row.commission_percentage = terms.commission_percentage;
    Ok(row.clone())
  }

  fn set_group_status(&self, id: i64, status: GroupStatus) -> Result<()> {
    let mut s = self.lock()?;
    let row = s.groups.get_mut(&id).ok_or_else(|| DomainError::NotFound(format!("grupo {}", id)))?;
    row.status = status;
    Ok(())
  }

  fn delete_group(&self, id: i64) -> Result<()> {
    let mut s = self.lock()?;
    if s.groups.remove(&id).is_none() {
      return Err(DomainError::NotFound(format!("grupo {}", id)));
    }
    s.memberships.retain(|m| m.group_id != id);
    s.chit_dates.retain(|d| d.group_id != id);
    s.schedules.remove(&id);
    s.collections.retain(|c| c.group_id != id);
    s.balances.retain(|(g, _, _), _| *g != id);
    Ok(())
  }

  fn group_tables(&self, id: i64) -> Result<GroupTableSet> {
    let s = self.lock()?;
    let g = s.group(id)?;
    Ok(GroupTableSet::new(g.id, &g.name))
  }

  fn add_group_member(&self, group_id: i64, member_id: i64, group_member_id: &str) -> Result<GroupMember> {
    let mut s = self.lock()?;
    s.group(group_id)?;
    if !s.members.contains_key(&member_id) {
      return Err(DomainError::NotFound(format!("socio {}", member_id)));
    }
    if s.memberships.iter().any(|m| m.group_id == group_id && m.member_id == member_id) {
      return Err(DomainError::Constraint(format!("el socio {} ya está inscrito en el grupo {}", member_id, group_id)));
    }
    s.next_membership_id += 1;
    let row = GroupMember { id: s.next_membership_id,
                            group_id,
                            member_id,
                            group_member_id: group_member_id.to_string() };
    s.memberships.push(row.clone());
    Ok(row)
  }

  fn remove_group_member(&self, group_id: i64, member_id: i64) -> Result<()> {
    let mut s = self.lock()?;
    let before = s.memberships.len();
    s.memberships.retain(|m| !(m.group_id == group_id && m.member_id == member_id));
    if s.memberships.len() == before {
      return Err(DomainError::NotFound(format!("socio {} en grupo {}", member_id, group_id)));
    }
    Ok(())
  }

  fn list_group_members(&self, group_id: i64) -> Result<Vec<GroupMember>> {
    let s = self.lock()?;
    s.group(group_id)?;
    Ok(s.memberships.iter().filter(|m| m.group_id == group_id).cloned().collect())
  }

  fn list_chit_dates(&self, group_id: i64) -> Result<Vec<ChitDate>> {
    let s = self.lock()?;
    s.group(group_id)?;
    let mut dates: Vec<ChitDate> = s.chit_dates.iter().filter(|d| d.group_id == group_id).cloned().collect();
    dates.sort_by_key(|d| d.chit_date);
    Ok(dates)
  }

  fn get_schedule(&self, group_id: i64) -> Result<Vec<SubscriptionLine>> {
    let s = self.lock()?;
    s.group(group_id)?;
    Ok(s.schedules.get(&group_id).cloned().unwrap_or_default())
  }

  fn record_collection(&self,
                       group_id: i64,
                       member_id: i64,
                       installment: i32,
                       amount: Decimal,
                       date: NaiveDate)
                       -> Result<CollectionEvent> {
    validate_collection_amount(amount)?;
    let mut s = self.lock()?;
    let group = s.group(group_id)?.clone();
    if installment < 0 || installment > group.number_of_months {
      return Err(DomainError::Validation(format!("período {} fuera de 0..={}", installment, group.number_of_months)));
    }
    if !s.members.contains_key(&member_id) {
      return Err(DomainError::NotFound(format!("socio {}", member_id)));
    }
    let due = s.due_for(&group, installment);
    let key = (group_id, member_id, installment);
    let prior = s.balances.get(&key).map(state_of).unwrap_or_else(|| BalanceState::open(due));
    let next = prior.apply_delta(amount);

    s.next_collection_id += 1;
    let event = CollectionEvent { id: s.next_collection_id,
                                  group_id,
                                  member_id,
                                  installment_number: installment,
                                  amount,
                                  collection_date: date,
                                  remaining_balance: next.remaining_balance,
                                  is_completed: next.is_completed };
    s.collections.push(event.clone());
    let entry = s.balances.entry(key).or_insert(BalanceRecord { group_id,
                                                                member_id,
                                                                installment_number: installment,
                                                                total_paid: Decimal::ZERO,
                                                                remaining_balance: due,
                                                                is_completed: false,
                                                                export_month_number: None,
                                                                is_exported: false });
    entry.total_paid = next.total_paid;
    entry.remaining_balance = next.remaining_balance;
    entry.is_completed = next.is_completed;
    Ok(event)
  }

  fn edit_collection(&self, group_id: i64, collection_id: i64, new_amount: Decimal) -> Result<CollectionEvent> {
    validate_collection_amount(new_amount)?;
    let mut s = self.lock()?;
    let (member_id, installment, old_amount) = {
      let ev = s.collections
                .iter()
                .find(|c| c.group_id == group_id && c.id == collection_id)
                .ok_or_else(|| DomainError::NotFound(format!("cobro {}", collection_id)))?;
      (ev.member_id, ev.installment_number, ev.amount)
    };
    // El delta se aplica a la clave guardada en el apunte, nunca a la de la
    // petición: evita corromper otro período.
    let key = (group_id, member_id, installment);
    let balance = s.balances
                   .get(&key)
                   .map(state_of)
                   .ok_or_else(|| DomainError::Storage(format!("saldo ausente para el cobro {}", collection_id)))?;
    let next = balance.apply_delta(new_amount - old_amount);
    let entry = s.balances.get_mut(&key).ok_or_else(|| DomainError::Storage("saldo desaparecido".to_string()))?;
    entry.total_paid = next.total_paid;
    entry.remaining_balance = next.remaining_balance;
    entry.is_completed = next.is_completed;

    let ev = s.collections
              .iter_mut()
              .find(|c| c.group_id == group_id && c.id == collection_id)
              .ok_or_else(|| DomainError::NotFound(format!("cobro {}", collection_id)))?;
    ev.amount = new_amount;
    ev.remaining_balance = next.remaining_balance;
    ev.is_completed = next.is_completed;
    Ok(ev.clone())
  }

  fn delete_collection(&self, group_id: i64, collection_id: i64) -> Result<()> {
    let mut s = self.lock()?;
    let (member_id, installment, amount) = {
      let ev = s.collections
                .iter()
                .find(|c| c.group_id == group_id && c.id == collection_id)
                .ok_or_else(|| DomainError::NotFound(format!("cobro {}", collection_id)))?;
      (ev.member_id, ev.installment_number, ev.amount)
    };
    // Primero la reversión sobre el saldo, después el borrado del apunte.
    let key = (group_id, member_id, installment);
    let balance = s.balances
                   .get(&key)
                   .map(state_of)
                   .ok_or_else(|| DomainError::Storage(format!("saldo ausente para el cobro {}", collection_id)))?;
    let next = balance.apply_delta(-amount);
    let entry = s.balances.get_mut(&key).ok_or_else(|| DomainError::Storage("saldo desaparecido".to_string()))?;
    entry.total_paid = next.total_paid;
    entry.remaining_balance = next.remaining_balance;
    entry.is_completed = next.is_completed;
    s.collections.retain(|c| !(c.group_id == group_id && c.id == collection_id));
    Ok(())
  }

  fn get_collection(&self, group_id: i64, collection_id: i64) -> Result<Option<CollectionEvent>> {
    let s = self.lock()?;
    s.group(group_id)?;
    Ok(s.collections.iter().find(|c| c.group_id == group_id && c.id == collection_id).cloned())
  }

  fn list_collections(&self, group_id: i64) -> Result<Vec<CollectionEvent>> {
    let s = self.lock()?;
    s.group(group_id)?;
    Ok(s.collections.iter().filter(|c| c.group_id == group_id).cloned().collect())
  }

  fn list_balances(&self, group_id: i64) -> Result<Vec<BalanceRecord>> {
    let s = self.lock()?;
    s.group(group_id)?;
    // El BTreeMap ya ordena por (grupo, socio, período).
    Ok(s.balances.values().filter(|b| b.group_id == group_id).cloned().collect())
  }

  fn customer_sheet(&self, group_id: i64) -> Result<Vec<CustomerSheetRow>> {
    let s = self.lock()?;
    s.group(group_id)?;
    let mut rows: Vec<CustomerSheetRow> = Vec::new();
    for b in s.balances.values().filter(|b| b.group_id == group_id) {
      if rows.last().map(|r| r.member_id) != Some(b.member_id) {
        let name = s.members.get(&b.member_id).map(|m| m.name.clone()).unwrap_or_default();
        rows.push(CustomerSheetRow { member_id: b.member_id,
                                     member_name: name,
                                     installments: Vec::new(),
                                     installment_summary: String::new() });
      }
      if let Some(row) = rows.last_mut() {
        row.installments.push(InstallmentBalance { installment_number: b.installment_number,
                                                   total_paid: b.total_paid,
                                                   remaining_balance: b.remaining_balance,
                                                   is_completed: b.is_completed });
      }
    }
    for row in rows.iter_mut() {
      let pairs: Vec<(i32, bool)> = row.installments.iter().map(|i| (i.installment_number, i.is_completed)).collect();
      row.installment_summary = installment_summary(&pairs);
    }
    Ok(rows)
  }

  fn is_month_exported(&self, group_id: i64, month: i32) -> Result<bool> {
    let s = self.lock()?;
    s.group(group_id)?;
    Ok(s.balances
        .values()
        .any(|b| b.group_id == group_id && b.export_month_number == Some(month) && b.is_exported))
  }

  fn export_month(&self, group_id: i64, month: i32) -> Result<()> {
    let mut s = self.lock()?;
    let group = s.group(group_id)?.clone();
    let due = s.due_for(&group, month);
    let member_ids: Vec<i64> =
      s.memberships.iter().filter(|m| m.group_id == group_id).map(|m| m.member_id).collect();
    for member_id in member_ids {
      let entry = s.balances
                   .entry((group_id, member_id, month))
                   .or_insert_with(|| BalanceRecord { group_id,
                                                      member_id,
                                                      installment_number: month,
                                                      total_paid: Decimal::ZERO,
                                                      remaining_balance: due,
                                                      is_completed: due <= Decimal::ZERO,
                                                      export_month_number: None,
                                                      is_exported: false });
      entry.export_month_number = Some(month);
      entry.is_exported = true;
    }
    Ok(())
  }

  fn reset_month_export(&self, group_id: i64, month: i32) -> Result<()> {
    let mut s = self.lock()?;
    s.group(group_id)?;
    for b in s.balances.values_mut() {
      if b.group_id == group_id && b.export_month_number == Some(month) {
        b.export_month_number = None;
        b.is_exported = false;
      }
    }
    Ok(())
  }
}

// Estado aritmético de una fila de saldo.
fn state_of(b: &BalanceRecord) -> BalanceState {
  BalanceState { total_paid: b.total_paid, remaining_balance: b.remaining_balance, is_completed: b.is_completed }
}
