use chrono::NaiveDate;
use fund_domain::{DomainError, FundRepository, GroupStatus, GroupTerms, InMemoryFundRepository, NewChitDate, NewGroup,
                  NewMember};
use rust_decimal::Decimal;

fn date(s: &str) -> NaiveDate {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("fecha de test")
}

fn new_group(name: &str) -> NewGroup {
  NewGroup { name: name.to_string(),
             total_amount: Decimal::from(120_000),
             member_count: 12,
             start_date: date("2024-01-05"),
             end_date: date("2025-01-05"),
             number_of_months: 12,
             commission_percentage: Some(Decimal::from(4)) }
}

fn setup() -> (InMemoryFundRepository, i64, i64) {
  let repo = InMemoryFundRepository::new();
  let group = repo.create_group(new_group("Sunrise Fund")).expect("crear grupo");
  let member = repo.create_member(NewMember { name: "Ana Pérez".into(),
                                              phone: Some("600111222".into()),
                                              address: None,
                                              email: None })
                   .expect("crear socio");
  repo.add_group_member(group.id, member.id, "S-01").expect("inscribir socio");
  (repo, group.id, member.id)
}

#[test]
fn collection_lifecycle_preserves_conservation() {
  let (repo, gid, mid) = setup();

  // Escenario B: cobro de 3000 sobre un período sin abrir (cuota 10000).
  let ev = repo.record_collection(gid, mid, 1, Decimal::from(3_000), date("2024-02-05")).expect("cobrar");
  assert_eq!(ev.remaining_balance, Decimal::from(7_000));
  assert!(!ev.is_completed);
  let balances = repo.list_balances(gid).expect("saldos");
  assert_eq!(balances.len(), 1);
  assert_eq!(balances[0].total_paid, Decimal::from(3_000));

  // Escenario C: editar a 10000 completa el período.
  let ev = repo.edit_collection(gid, ev.id, Decimal::from(10_000)).expect("editar");
  assert_eq!(ev.amount, Decimal::from(10_000));
  assert_eq!(ev.remaining_balance, Decimal::ZERO);
  assert!(ev.is_completed);
  let balances = repo.list_balances(gid).expect("saldos");
  assert!(balances[0].is_completed);

  // Escenario D: borrar revierte el importe y reabre el período.
  repo.delete_collection(gid, ev.id).expect("borrar");
  let balances = repo.list_balances(gid).expect("saldos");
  assert_eq!(balances[0].total_paid, Decimal::ZERO);
  assert_eq!(balances[0].remaining_balance, Decimal::from(10_000));
  assert!(!balances[0].is_completed);
  assert!(repo.list_collections(gid).expect("cobros").is_empty());
}

#[test]
fn total_paid_equals_sum_of_live_collections() {
  let (repo, gid, mid) = setup();
  let e1 = repo.record_collection(gid, mid, 2, Decimal::from(2_000), date("2024-03-05")).expect("cobro 1");
  let e2 = repo.record_collection(gid, mid, 2, Decimal::from(1_500), date("2024-03-12")).expect("cobro 2");
  let _e3 = repo.record_collection(gid, mid, 2, Decimal::from(500), date("2024-03-19")).expect("cobro 3");
  repo.edit_collection(gid, e2.id, Decimal::from(2_500)).expect("editar cobro 2");
  repo.delete_collection(gid, e1.id).expect("borrar cobro 1");

  let live: Decimal = repo.list_collections(gid)
                          .expect("cobros")
                          .iter()
                          .filter(|c| c.member_id == mid && c.installment_number == 2)
                          .map(|c| c.amount)
                          .sum();
  let balances = repo.list_balances(gid).expect("saldos");
  assert_eq!(balances[0].total_paid, live);
  assert_eq!(balances[0].remaining_balance, Decimal::from(10_000) - live);
}

#[test]
fn edit_uses_the_stored_installment_key() {
  let (repo, gid, mid) = setup();
  let ev1 = repo.record_collection(gid, mid, 1, Decimal::from(4_000), date("2024-02-05")).expect("cobro p1");
  repo.record_collection(gid, mid, 2, Decimal::from(6_000), date("2024-03-05")).expect("cobro p2");

  repo.edit_collection(gid, ev1.id, Decimal::from(5_000)).expect("editar p1");
  let balances = repo.list_balances(gid).expect("saldos");
  let p1 = balances.iter().find(|b| b.installment_number == 1).expect("saldo p1");
  let p2 = balances.iter().find(|b| b.installment_number == 2).expect("saldo p2");
  assert_eq!(p1.total_paid, Decimal::from(5_000));
  // El período 2 no se toca.
  assert_eq!(p2.total_paid, Decimal::from(6_000));
}

#[test]
fn schedule_regeneration_is_a_full_replace() {
  let (repo, gid, _mid) = setup();
  let terms = GroupTerms { total_amount: Decimal::from(120_000),
                           member_count: 12,
                           number_of_months: 12,
                           commission_percentage: Decimal::from(4) };
  let dates: Vec<NewChitDate> = (1..=11).map(|m| NewChitDate { chit_date: date(&format!("2024-{:02}-05", m)),
                                                               minimum_bid: Decimal::from(60_000) })
                                        .collect();
  repo.update_group_terms(gid, terms, dates).expect("actualizar términos");
  let schedule = repo.get_schedule(gid).expect("calendario");
  assert_eq!(schedule.len(), 13); // meses 0..=12
  assert_eq!(schedule[5].monthly_subscription, Decimal::from(5_400));

  // Regenerar con otra duración: nada del calendario anterior sobrevive.
  let terms = GroupTerms { number_of_months: 10, ..terms };
  repo.update_group_terms(gid, terms, Vec::new()).expect("regenerar");
  let schedule = repo.get_schedule(gid).expect("calendario");
  assert_eq!(schedule.len(), 11);
  assert!(schedule.iter().all(|l| l.month_number <= 10));
  assert!(repo.list_chit_dates(gid).expect("fechas").is_empty());
}

#[test]
fn export_month_is_idempotent_and_resettable() {
  let (repo, gid, mid) = setup();
  repo.record_collection(gid, mid, 3, Decimal::from(2_000), date("2024-04-05")).expect("cobro");

  assert!(!repo.is_month_exported(gid, 3).expect("consulta"));
  repo.export_month(gid, 3).expect("exportar");
  let first = repo.list_balances(gid).expect("saldos");
  assert!(repo.is_month_exported(gid, 3).expect("consulta"));
  // El saldo existente conserva su total pagado al exportarse.
  assert_eq!(first[0].total_paid, Decimal::from(2_000));
  assert!(first[0].is_exported);

  repo.export_month(gid, 3).expect("exportar otra vez");
  let second = repo.list_balances(gid).expect("saldos");
  assert_eq!(first, second);

  repo.reset_month_export(gid, 3).expect("reset");
  assert!(!repo.is_month_exported(gid, 3).expect("consulta"));
  let after = repo.list_balances(gid).expect("saldos");
  assert_eq!(after[0].total_paid, Decimal::from(2_000));
  assert!(!after[0].is_exported);
}

#[test]
fn export_seeds_missing_balances_for_every_enrolled_member() {
  let (repo, gid, _mid) = setup();
  let other = repo.create_member(NewMember { name: "Luis Gómez".into(), phone: None, address: None, email: None })
                  .expect("crear socio");
  repo.add_group_member(gid, other.id, "S-02").expect("inscribir");

  repo.export_month(gid, 1).expect("exportar");
  let balances = repo.list_balances(gid).expect("saldos");
  assert_eq!(balances.len(), 2);
  for b in &balances {
    assert_eq!(b.total_paid, Decimal::ZERO);
    assert_eq!(b.remaining_balance, Decimal::from(10_000));
    assert_eq!(b.export_month_number, Some(1));
    assert!(b.is_exported);
  }
}

#[test]
fn colliding_group_names_are_rejected() {
  let repo = InMemoryFundRepository::new();
  repo.create_group(new_group("Fund-1")).expect("crear grupo");
  match repo.create_group(new_group("fund.1")) {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("se esperaba Constraint por colisión de nombres, llegó: {:?}", other),
  }
  // El renombrado aplica la misma regla.
  let g2 = repo.create_group(new_group("Fund 2")).expect("crear grupo 2");
  match repo.rename_group(g2.id, "FUND(1)") {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("se esperaba Constraint al renombrar, llegó: {:?}", other),
  }
}

#[test]
fn member_delete_is_blocked_while_enrolled() {
  let (repo, gid, mid) = setup();
  match repo.delete_member(mid) {
    Err(DomainError::Constraint(_)) => {}
    other => panic!("se esperaba Constraint, llegó: {:?}", other),
  }
  repo.remove_group_member(gid, mid).expect("desinscribir");
  repo.delete_member(mid).expect("borrar socio");
  assert!(repo.get_member(mid).expect("consulta").is_none());
}

#[test]
fn customer_sheet_groups_installments_per_member() {
  let (repo, gid, mid) = setup();
  repo.record_collection(gid, mid, 1, Decimal::from(10_000), date("2024-02-05")).expect("p1 completo");
  repo.record_collection(gid, mid, 2, Decimal::from(3_000), date("2024-03-05")).expect("p2 parcial");

  let sheet = repo.customer_sheet(gid).expect("hoja");
  assert_eq!(sheet.len(), 1);
  let row = &sheet[0];
  assert_eq!(row.member_name, "Ana Pérez");
  assert_eq!(row.installments.len(), 2);
  assert_eq!(row.installment_summary, "1c,2");
}

#[test]
fn group_lifecycle_status_and_delete() {
  let (repo, gid, mid) = setup();
  repo.set_group_status(gid, GroupStatus::Closed).expect("cerrar");
  assert_eq!(repo.get_group(gid).expect("grupo").map(|g| g.status), Some(GroupStatus::Closed));

  repo.record_collection(gid, mid, 1, Decimal::from(1_000), date("2024-02-05")).expect("cobro");
  repo.delete_group(gid).expect("borrar grupo");
  assert!(repo.get_group(gid).expect("consulta").is_none());
  // Un grupo borrado deja de resolverse: las lecturas dependientes fallan
  // con NotFound, igual que en el repositorio Diesel.
  match repo.list_balances(gid) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound tras borrar el grupo, no: {:?}", other),
  }
}

#[test]
fn reads_on_unknown_group_fail_with_not_found() {
  let repo = InMemoryFundRepository::new();
  match repo.list_balances(99) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en saldos, no: {:?}", other),
  }
  match repo.list_collections(99) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en cobros, no: {:?}", other),
  }
  match repo.get_collection(99, 1) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en el apunte, no: {:?}", other),
  }
  match repo.list_chit_dates(99) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en fechas, no: {:?}", other),
  }
  match repo.get_schedule(99) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en el calendario, no: {:?}", other),
  }
  match repo.list_group_members(99) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en inscripciones, no: {:?}", other),
  }
  match repo.is_month_exported(99, 1) {
    Err(DomainError::NotFound(_)) => {}
    other => panic!("se esperaba NotFound en exportación, no: {:?}", other),
  }
}
