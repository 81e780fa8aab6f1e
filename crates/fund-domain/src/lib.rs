mod errors;
mod ledger;
mod models;
mod money;
mod repository;
mod schedule;
mod tables;

pub use errors::{DomainError, Result};
pub use ledger::{installment_summary, validate_collection_amount, BalanceState};
pub use models::{BalanceRecord, ChitDate, CollectionEvent, CustomerSheetRow, Group, GroupMember, GroupStatus,
                 InstallmentBalance, Member, MemberStatus, NewChitDate, NewGroup, NewMember, SubscriptionLine,
                 DEFAULT_COMMISSION_PERCENTAGE};
pub use money::{from_cents, round_money, to_cents, DECIMAL_PLACES};
pub use repository::{FundRepository, InMemoryFundRepository};
pub use schedule::{build_schedule, GroupTerms};
pub use tables::{sanitize_group_name, table_name, GroupTableSet, TableKind};
