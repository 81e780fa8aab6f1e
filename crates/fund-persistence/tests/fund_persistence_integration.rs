use chrono::NaiveDate;
use fund_domain::{DomainError, FundRepository, GroupStatus, GroupTerms, MemberStatus, NewChitDate, NewGroup,
                  NewMember};
use fund_persistence::DieselFundRepository;
use rust_decimal::Decimal;
use uuid::Uuid;

// Cada test usa un fichero SQLite temporal propio para poder correr en
// paralelo sin compartir estado.
fn temp_repo() -> (DieselFundRepository, std::path::PathBuf) {
  let tmp_path = std::env::temp_dir().join(format!("fund_test_{}.db", Uuid::new_v4()));
  let db_url = tmp_path.to_str().unwrap().to_string();
  let repo = DieselFundRepository::new(&db_url).expect("failed to create repo");
  (repo, tmp_path)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

// Grupo de referencia: 120000 entre 12 socios a 12 meses, comisión 4%.
// Suscripción base 10000.
fn sample_group(name: &str) -> NewGroup {
  NewGroup { name: name.to_string(),
             total_amount: Decimal::from(120_000),
             member_count: 12,
             start_date: date(2024, 1, 1),
             end_date: date(2024, 12, 31),
             number_of_months: 12,
             commission_percentage: None }
}

fn sample_member(name: &str) -> NewMember {
  NewMember { name: name.to_string(), phone: None, address: None, email: None }
}

#[test]
fn group_lifecycle_provisions_renames_and_deletes() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Enero")).expect("create group");
  // La comisión por defecto se fija en el alta.
  assert_eq!(group.commission_percentage, Decimal::from(4));
  assert_eq!(group.status, GroupStatus::Active);

  // Las tablas quedan aprovisionadas en la misma transacción: las lecturas
  // dependientes de tabla responden vacío, no error.
  assert!(repo.list_balances(group.id).expect("balances").is_empty());
  assert!(repo.list_collections(group.id).expect("collections").is_empty());
  let tables = repo.group_tables(group.id).expect("tables");
  assert!(tables.balance.contains(&format!("_{}_", group.id)));

  // Un nombre que normaliza igual colisiona aunque difiera en mayúsculas y
  // signos.
  match repo.create_group(sample_group("FONDO-ENERO")) {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("expected constraint on colliding name, got: {:?}", other),
  }

  // El renombrado conserva los datos: registra un cobro, renombra y el
  // apunte sigue ahí con el mismo id.
  let member = repo.create_member(sample_member("Ana")).expect("create member");
  repo.add_group_member(group.id, member.id, "A1").expect("enroll");
  let ev = repo.record_collection(group.id, member.id, 1, Decimal::from(4_000), date(2024, 1, 5))
               .expect("record");
  let renamed = repo.rename_group(group.id, "Fondo Febrero").expect("rename");
  assert_eq!(renamed.name, "Fondo Febrero");
  let after = repo.get_collection(group.id, ev.id).expect("get").expect("collection survives rename");
  assert_eq!(after.amount, Decimal::from(4_000));
  let new_tables = repo.group_tables(group.id).expect("tables");
  assert_ne!(tables.collection, new_tables.collection);

  // Renombrar hacia un nombre en colisión también se rechaza.
  repo.create_group(sample_group("Fondo Marzo")).expect("create second group");
  match repo.rename_group(group.id, "fondo marzo") {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("expected constraint on colliding rename, got: {:?}", other),
  }

  // El borrado elimina el grupo y sus tablas.
  repo.delete_group(group.id).expect("delete group");
  assert!(repo.get_group(group.id).expect("get group").is_none());
  match repo.list_balances(group.id) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("expected not found after delete, got: {:?}", other),
  }
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn collection_lifecycle_keeps_ledger_and_balance_in_step() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Abril")).expect("create group");
  let member = repo.create_member(sample_member("Bruno")).expect("create member");
  repo.add_group_member(group.id, member.id, "B1").expect("enroll");

  // Calendario con puja de 60000 en el mes 1: dividendo 55200, reparto
  // 4600, suscripción 5400.
  let terms = GroupTerms { total_amount: Decimal::from(120_000),
                           member_count: 12,
                           number_of_months: 12,
                           commission_percentage: Decimal::from(4) };
  let dates: Vec<NewChitDate> =
    (1..=11).map(|m| NewChitDate { chit_date: date(2024, m, 15),
                                   minimum_bid: if m == 1 { Decimal::from(60_000) } else { Decimal::from(120_000) } })
            .collect();
  repo.update_group_terms(group.id, terms, dates).expect("schedule");
  let schedule = repo.get_schedule(group.id).expect("get schedule");
  assert_eq!(schedule.len(), 13); // meses 0..=12
  let month1 = schedule.iter().find(|l| l.month_number == 1).unwrap();
  assert_eq!(month1.monthly_subscription, Decimal::new(540_000, 2));
  assert_eq!(month1.distributed_dividend, Decimal::new(460_000, 2));

  // Pago parcial: 4000 sobre una cuota de 5400.
  let ev1 = repo.record_collection(group.id, member.id, 1, Decimal::from(4_000), date(2024, 1, 20))
                .expect("partial");
  assert_eq!(ev1.remaining_balance, Decimal::new(140_000, 2));
  assert!(!ev1.is_completed);

  // Segundo pago que completa el período.
  let ev2 = repo.record_collection(group.id, member.id, 1, Decimal::new(140_000, 2), date(2024, 1, 25))
                .expect("completing");
  assert_eq!(ev2.remaining_balance, Decimal::ZERO);
  assert!(ev2.is_completed);

  // Editar el primer cobro a la baja reabre el período.
  let edited = repo.edit_collection(group.id, ev1.id, Decimal::from(3_000)).expect("edit");
  assert_eq!(edited.amount, Decimal::from(3_000));
  assert_eq!(edited.remaining_balance, Decimal::from(1_000));
  assert!(!edited.is_completed);

  // Borrar el segundo cobro revierte su importe sobre el saldo.
  repo.delete_collection(group.id, ev2.id).expect("delete collection");
  let balances = repo.list_balances(group.id).expect("balances");
  let b = balances.iter()
                  .find(|b| b.member_id == member.id && b.installment_number == 1)
                  .expect("balance row");
  assert_eq!(b.total_paid, Decimal::from(3_000));
  assert_eq!(b.remaining_balance, Decimal::new(240_000, 2));
  assert!(!b.is_completed);

  // El diario sólo conserva el apunte editado.
  let events = repo.list_collections(group.id).expect("list");
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].id, ev1.id);
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn schedule_is_replaced_wholesale() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Mayo")).expect("create group");
  let terms = GroupTerms { total_amount: Decimal::from(120_000),
                           member_count: 12,
                           number_of_months: 12,
                           commission_percentage: Decimal::from(4) };
  let dates: Vec<NewChitDate> =
    (1..=11).map(|m| NewChitDate { chit_date: date(2024, m, 15), minimum_bid: Decimal::from(120_000) }).collect();
  repo.update_group_terms(group.id, terms, dates).expect("first schedule");
  assert_eq!(repo.get_schedule(group.id).expect("schedule").len(), 13);
  assert_eq!(repo.list_chit_dates(group.id).expect("dates").len(), 11);

  // Regenerar con menos meses no deja líneas huérfanas del calendario
  // anterior.
  let shorter = GroupTerms { total_amount: Decimal::from(120_000),
                             member_count: 12,
                             number_of_months: 10,
                             commission_percentage: Decimal::from(4) };
  let fewer: Vec<NewChitDate> =
    (1..=9).map(|m| NewChitDate { chit_date: date(2024, m, 15), minimum_bid: Decimal::from(120_000) }).collect();
  repo.update_group_terms(group.id, shorter, fewer).expect("second schedule");
  assert_eq!(repo.get_schedule(group.id).expect("schedule").len(), 11);
  assert_eq!(repo.list_chit_dates(group.id).expect("dates").len(), 9);
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn export_month_is_idempotent_and_resettable() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Junio")).expect("create group");
  let m1 = repo.create_member(sample_member("Clara")).expect("m1");
  let m2 = repo.create_member(sample_member("Diego")).expect("m2");
  repo.add_group_member(group.id, m1.id, "C1").expect("enroll m1");
  repo.add_group_member(group.id, m2.id, "D2").expect("enroll m2");

  // Sólo uno tiene pagos; la exportación siembra el saldo del otro.
  repo.record_collection(group.id, m1.id, 2, Decimal::from(4_000), date(2024, 2, 10)).expect("record");
  assert!(!repo.is_month_exported(group.id, 2).expect("pre"));
  repo.export_month(group.id, 2).expect("export");
  assert!(repo.is_month_exported(group.id, 2).expect("post"));

  let balances = repo.list_balances(group.id).expect("balances");
  let seeded = balances.iter()
                       .find(|b| b.member_id == m2.id && b.installment_number == 2)
                       .expect("seeded row for member without payments");
  assert_eq!(seeded.total_paid, Decimal::ZERO);
  assert_eq!(seeded.remaining_balance, Decimal::from(10_000));
  assert!(seeded.is_exported);
  let paid = balances.iter().find(|b| b.member_id == m1.id && b.installment_number == 2).expect("paid row");
  // La re-marca no pisa los pagos acumulados.
  assert_eq!(paid.total_paid, Decimal::from(4_000));
  assert!(paid.is_exported);

  // Repetir la exportación deja el mismo estado.
  repo.export_month(group.id, 2).expect("export again");
  let again = repo.list_balances(group.id).expect("balances");
  assert_eq!(again.len(), balances.len());
  let paid = again.iter().find(|b| b.member_id == m1.id && b.installment_number == 2).expect("paid row");
  assert_eq!(paid.total_paid, Decimal::from(4_000));

  // El reinicio limpia las marcas pero conserva pagos y filas.
  repo.reset_month_export(group.id, 2).expect("reset");
  assert!(!repo.is_month_exported(group.id, 2).expect("after reset"));
  let after = repo.list_balances(group.id).expect("balances");
  assert_eq!(after.len(), balances.len());
  assert!(after.iter().all(|b| !b.is_exported && b.export_month_number.is_none()));
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn member_deletion_blocked_while_enrolled() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Julio")).expect("create group");
  let member = repo.create_member(sample_member("Elena")).expect("create member");
  repo.add_group_member(group.id, member.id, "E1").expect("enroll");

  // Doble inscripción rechazada por la restricción (grupo, socio).
  match repo.add_group_member(group.id, member.id, "E1-bis") {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("expected constraint on double enrollment, got: {:?}", other),
  }

  match repo.delete_member(member.id) {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("expected constraint while enrolled, got: {:?}", other),
  }
  repo.remove_group_member(group.id, member.id).expect("unenroll");
  repo.delete_member(member.id).expect("delete after unenroll");
  assert!(repo.get_member(member.id).expect("get").is_none());
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn member_update_changes_status() {
  let (repo, tmp_path) = temp_repo();
  let member = repo.create_member(sample_member("Fede")).expect("create");
  assert_eq!(member.status, MemberStatus::Active);
  let updated = repo.update_member(member.id,
                                   NewMember { name: "Federico".to_string(),
                                               phone: Some("600111222".to_string()),
                                               address: None,
                                               email: None },
                                   MemberStatus::Inactive)
                    .expect("update");
  assert_eq!(updated.name, "Federico");
  assert_eq!(updated.status, MemberStatus::Inactive);
  let reread = repo.get_member(member.id).expect("get").expect("exists");
  assert_eq!(reread, updated);
  let _ = std::fs::remove_file(tmp_path);
}

#[test]
fn customer_sheet_summarizes_installments() {
  let (repo, tmp_path) = temp_repo();
  let group = repo.create_group(sample_group("Fondo Agosto")).expect("create group");
  let member = repo.create_member(sample_member("Gloria")).expect("create member");
  repo.add_group_member(group.id, member.id, "G1").expect("enroll");

  // Período 1 completo (base 10000), período 2 parcial.
  repo.record_collection(group.id, member.id, 1, Decimal::from(10_000), date(2024, 1, 10)).expect("full");
  repo.record_collection(group.id, member.id, 2, Decimal::from(2_500), date(2024, 2, 10)).expect("partial");

  let sheet = repo.customer_sheet(group.id).expect("sheet");
  assert_eq!(sheet.len(), 1);
  let row = &sheet[0];
  assert_eq!(row.member_name, "Gloria");
  assert_eq!(row.installments.len(), 2);
  assert_eq!(row.installment_summary, "1c,2");
  let _ = std::fs::remove_file(tmp_path);
}
