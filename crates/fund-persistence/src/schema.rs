// Esquema Diesel de las tablas globales (SQLite). Las tablas por grupo no
// pueden declararse aquí: sus nombres se derivan en tiempo de ejecución de
// (id, nombre del grupo) y se consultan con `diesel::sql_query`.
use diesel::allow_tables_to_appear_in_same_query;

diesel::table! {
    members (id) {
        id -> BigInt,
        name -> Text,
        phone -> Nullable<Text>,
        address -> Nullable<Text>,
        email -> Nullable<Text>,
        status -> Text,
    }
}

diesel::table! {
    groups (id) {
        id -> BigInt,
        name -> Text,
        total_amount_cents -> BigInt,
        member_count -> Integer,
        start_date -> Text,
        end_date -> Text,
        number_of_months -> Integer,
        commission_percentage -> Text,
        status -> Text,
    }
}

// Propiedad de la capa de autenticación externa; declarada por completitud
// del esquema persistido.
diesel::table! {
    users (id) {
        id -> BigInt,
        name -> Text,
        email -> Text,
        password -> Text,
        role -> Nullable<Text>,
    }
}

allow_tables_to_appear_in_same_query!(members, groups);
