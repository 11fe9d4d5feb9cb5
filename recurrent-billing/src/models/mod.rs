//! Domain models for recurrent-billing.

mod payment;
mod recurrent_charge;
mod subscription;

pub use payment::{
    CreatePayment, CreatePaymentLog, Payment, PaymentLog, PaymentStatus, SavePaymentStatus,
    StoredPaymentMethod,
};
pub use recurrent_charge::{
    Actor, ChargeUpdate, CreateRecurrentCharge, RecurrentCharge, RecurrentChargeState,
};
pub use subscription::{CatalogTerms, SubscriptionSnapshot};
