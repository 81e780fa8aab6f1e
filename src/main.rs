use std::error::Error;
use std::io::{self, Write};
use chrono::NaiveDate;
use fund_domain::{FundRepository, NewGroup, NewMember};
use rust_decimal::Decimal;

/// Pequeño menú interactivo para administrar el fondo usando el
/// repositorio proporcionado por `fund-persistence`.
///
/// Opciones soportadas:
/// 1) Ver grupos (tabla con id, nombre y estado)
/// 2) Crear grupo
/// 3) Alta de socio
/// 4) Inscribir socio en un grupo
/// 5) Registrar cobro
/// 6) Hoja de cliente de un grupo
/// 7) Exportar mes de un grupo
/// 8) Salir
fn main() -> Result<(), Box<dyn Error>> {
    // Inicializar repo (aplica migraciones embebidas si procede)
    let repo = fund_persistence::new_from_env().map_err(|e| Box::new(e) as Box<dyn Error>)?;

    loop {
        println!("\n== Fondo CLI menu ==");
        println!("1) Ver grupos");
        println!("2) Crear grupo");
        println!("3) Alta de socio");
        println!("4) Inscribir socio en un grupo");
        println!("5) Registrar cobro");
        println!("6) Hoja de cliente");
        println!("7) Exportar mes");
        println!("8) Salir");
        print!("Elige una opción: ");
        io::stdout().flush().ok();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice)?;
        match choice.trim() {
            "1" => {
                match repo.list_groups() {
                    Ok(groups) => {
                        println!("\nID   | NOMBRE                        | ESTADO   | TOTAL");
                        println!("--------------------------------------------------------");
                        for g in groups {
                            println!("{:<4} | {:<29} | {:<8} | {}", g.id, g.name, g.status, g.total_amount);
                        }
                    }
                    Err(e) => eprintln!("Error listando grupos: {}", e),
                }
            }
            "2" => {
                let name = prompt("Nombre del grupo: ")?;
                let total = match parse_amount(&prompt("Importe total: ")?) {
                    Some(d) => d,
                    None => { eprintln!("Importe inválido"); continue; }
                };
                let member_count: i32 = match prompt("Número de socios: ")?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Número inválido"); continue; }
                };
                let months: i32 = match prompt("Número de meses: ")?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Número inválido"); continue; }
                };
                let start = match parse_date(&prompt("Fecha de inicio (AAAA-MM-DD): ")?) {
                    Some(d) => d,
                    None => { eprintln!("Fecha inválida"); continue; }
                };
                let end = match parse_date(&prompt("Fecha de fin (AAAA-MM-DD): ")?) {
                    Some(d) => d,
                    None => { eprintln!("Fecha inválida"); continue; }
                };
                let commission_s = prompt("Comisión % (enter para la estándar): ")?;
                let commission = if commission_s.trim().is_empty() {
                    None
                } else {
                    match parse_amount(&commission_s) {
                        Some(d) => Some(d),
                        None => { eprintln!("Comisión inválida"); continue; }
                    }
                };
                let new_group = NewGroup { name: name.trim().to_string(),
                                           total_amount: total,
                                           member_count,
                                           start_date: start,
                                           end_date: end,
                                           number_of_months: months,
                                           commission_percentage: commission };
                match repo.create_group(new_group) {
                    Ok(g) => println!("Grupo creado: {} ({})", g.id, g.name),
                    Err(e) => eprintln!("Error creando grupo: {}", e),
                }
            }
            "3" => {
                let name = prompt("Nombre del socio: ")?;
                let phone = prompt("Teléfono (enter para vacío): ")?;
                let phone_opt = if phone.trim().is_empty() { None } else { Some(phone.trim().to_string()) };
                let new_member = NewMember { name: name.trim().to_string(),
                                             phone: phone_opt,
                                             address: None,
                                             email: None };
                match repo.create_member(new_member) {
                    Ok(m) => println!("Socio creado: {} ({})", m.id, m.name),
                    Err(e) => eprintln!("Error creando socio: {}", e),
                }
            }
            "4" => {
                let group_id = match prompt("Id del grupo: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                let member_id = match prompt("Id del socio: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                let label = prompt("Etiqueta de secuencia (ej: A1): ")?;
                match repo.add_group_member(group_id, member_id, label.trim()) {
                    Ok(gm) => println!("Inscripción creada: {}", gm.id),
                    Err(e) => eprintln!("Error inscribiendo: {}", e),
                }
            }
            "5" => {
                let group_id = match prompt("Id del grupo: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                let member_id = match prompt("Id del socio: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                let installment: i32 = match prompt("Período (mes): ")?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Período inválido"); continue; }
                };
                let amount = match parse_amount(&prompt("Importe: ")?) {
                    Some(d) => d,
                    None => { eprintln!("Importe inválido"); continue; }
                };
                let date = match parse_date(&prompt("Fecha (AAAA-MM-DD): ")?) {
                    Some(d) => d,
                    None => { eprintln!("Fecha inválida"); continue; }
                };
                match repo.record_collection(group_id, member_id, installment, amount, date) {
                    Ok(ev) => println!("Cobro {}: pendiente {}, completado: {}", ev.id, ev.remaining_balance,
                                       ev.is_completed),
                    Err(e) => eprintln!("Error registrando cobro: {}", e),
                }
            }
            "6" => {
                let group_id = match prompt("Id del grupo: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                match repo.customer_sheet(group_id) {
                    Ok(sheet) => {
                        println!("\nSOCIO | NOMBRE                        | PERÍODOS");
                        println!("------------------------------------------------");
                        for row in sheet {
                            println!("{:<5} | {:<29} | {}", row.member_id, row.member_name, row.installment_summary);
                        }
                    }
                    Err(e) => eprintln!("Error generando la hoja: {}", e),
                }
            }
            "7" => {
                let group_id = match prompt("Id del grupo: ")?.trim().parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Id inválido"); continue; }
                };
                let month: i32 = match prompt("Mes a exportar: ")?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => { eprintln!("Mes inválido"); continue; }
                };
                match repo.is_month_exported(group_id, month) {
                    Ok(true) => {
                        let confirm = prompt("El mes ya está exportado. ¿Repetir? escribir 'yes' para confirmar: ")?;
                        if confirm.trim().to_lowercase() != "yes" {
                            println!("Exportación cancelada");
                            continue;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => { eprintln!("Error comprobando exportación: {}", e); continue; }
                }
                match repo.export_month(group_id, month) {
                    Ok(()) => println!("Mes {} exportado para el grupo {}", month, group_id),
                    Err(e) => eprintln!("Error exportando: {}", e),
                }
            }
            "8" => {
                println!("Saliendo...");
                break;
            }
            other => {
                println!("Opción inválida: {}", other);
            }
        }
    }

    Ok(())
}

fn prompt(msg: &str) -> io::Result<String> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s)
}

fn parse_amount(s: &str) -> Option<Decimal> {
    s.trim().parse::<Decimal>().ok()
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}
