pub mod commission;
pub mod events;
pub mod ledger;
pub mod money;
pub mod payee;
pub mod ports;
pub mod sla;
