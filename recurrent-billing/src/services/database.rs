//! PostgreSQL store for recurrent-billing.

use crate::models::{
    CreatePayment, CreatePaymentLog, CreateRecurrentCharge, Payment, PaymentLog, RecurrentCharge,
    RecurrentChargeState, SavePaymentStatus, StoredPaymentMethod,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::ChargeStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "payment_id, user_id, gateway, status, amount, paid_at, subscription_id, catalog_item_id, address_id, is_recurrent, parent_payment_id, note, error_message, created_utc, updated_utc";

const METHOD_COLUMNS: &str = "method_id, user_id, gateway, external_token, expires_on, created_utc";

const CHARGE_COLUMNS: &str = "rc.charge_id, rc.method_id, rc.parent_payment_id, rc.payment_id, rc.charge_at, rc.retries, rc.custom_amount, rc.renewal_catalog_item_id, rc.state, rc.status, rc.note, m.external_token, rc.created_utc, rc.updated_utc";

const LOG_COLUMNS: &str = "log_id, payment_id, charge_id, success, result_code, result_message, response, created_utc";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "recurrent-billing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ChargeStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(user_id = %input.user_id, gateway = %input.gateway))]
    async fn create_payment(&self, input: &CreatePayment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, user_id, gateway, status, amount, subscription_id, catalog_item_id, address_id, is_recurrent, parent_payment_id)
            VALUES ($1, $2, $3, 'form', $4, $5, $6, $7, $8, $9)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(&input.gateway)
        .bind(input.amount)
        .bind(input.subscription_id)
        .bind(input.catalog_item_id)
        .bind(input.address_id)
        .bind(input.is_recurrent)
        .bind(input.parent_payment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create payment", e))?;

        timer.observe_duration();
        info!(payment_id = %payment.payment_id, amount = %payment.amount, "Payment created");

        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get payment", e))?;

        timer.observe_duration();

        Ok(payment)
    }

    #[instrument(skip(self, input), fields(payment_id = %payment_id, status = %input.status))]
    async fn save_payment_status(
        &self,
        payment_id: Uuid,
        input: &SavePaymentStatus,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_payment_status"])
            .start_timer();

        // paid_at is write-once: COALESCE keeps an existing value.
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET status = $2,
                paid_at = COALESCE(paid_at, $3),
                note = COALESCE($4, note),
                error_message = COALESCE($5, error_message)
            WHERE payment_id = $1
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(input.status)
        .bind(input.paid_at)
        .bind(&input.note)
        .bind(&input.error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save payment status", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;

        timer.observe_duration();

        Ok(payment)
    }

    // =========================================================================
    // Stored Payment Method Operations
    // =========================================================================

    #[instrument(skip(self, external_token), fields(user_id = %user_id, gateway = %gateway))]
    async fn find_or_create_method(
        &self,
        user_id: Uuid,
        gateway: &str,
        external_token: &str,
    ) -> Result<StoredPaymentMethod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_or_create_method"])
            .start_timer();

        // The no-op update makes RETURNING yield the existing row on conflict.
        let method = sqlx::query_as::<_, StoredPaymentMethod>(&format!(
            r#"
            INSERT INTO stored_payment_methods (method_id, user_id, gateway, external_token)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, gateway, external_token)
            DO UPDATE SET external_token = EXCLUDED.external_token
            RETURNING {METHOD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(gateway)
        .bind(external_token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to store payment method", e))?;

        timer.observe_duration();

        Ok(method)
    }

    #[instrument(skip(self), fields(method_id = %method_id))]
    async fn get_method(&self, method_id: Uuid) -> Result<Option<StoredPaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_method"])
            .start_timer();

        let method = sqlx::query_as::<_, StoredPaymentMethod>(&format!(
            "SELECT {METHOD_COLUMNS} FROM stored_payment_methods WHERE method_id = $1"
        ))
        .bind(method_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get payment method", e))?;

        timer.observe_duration();

        Ok(method)
    }

    #[instrument(skip(self))]
    async fn list_methods_for_gateway(
        &self,
        gateway: &str,
    ) -> Result<Vec<StoredPaymentMethod>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_methods_for_gateway"])
            .start_timer();

        let methods = sqlx::query_as::<_, StoredPaymentMethod>(&format!(
            "SELECT {METHOD_COLUMNS} FROM stored_payment_methods WHERE gateway = $1 ORDER BY created_utc"
        ))
        .bind(gateway)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list payment methods", e))?;

        timer.observe_duration();

        Ok(methods)
    }

    #[instrument(skip(self), fields(method_id = %method_id))]
    async fn set_method_expiry(
        &self,
        method_id: Uuid,
        expires_on: NaiveDate,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_method_expiry"])
            .start_timer();

        sqlx::query("UPDATE stored_payment_methods SET expires_on = $2 WHERE method_id = $1")
            .bind(method_id)
            .bind(expires_on)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to set method expiry", e))?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Recurrent Charge Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(parent_payment_id = %input.parent_payment_id))]
    async fn create_charge(
        &self,
        input: &CreateRecurrentCharge,
    ) -> Result<RecurrentCharge, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_charge"])
            .start_timer();

        let charge = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            WITH rc AS (
                INSERT INTO recurrent_charges (charge_id, method_id, parent_payment_id, charge_at, retries, custom_amount, renewal_catalog_item_id, state, note)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING *
            )
            SELECT {CHARGE_COLUMNS}
            FROM rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.method_id)
        .bind(input.parent_payment_id)
        .bind(input.charge_at)
        .bind(input.retries)
        .bind(input.custom_amount)
        .bind(input.renewal_catalog_item_id)
        .bind(RecurrentChargeState::Active)
        .bind(&input.note)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create recurrent charge", e))?;

        timer.observe_duration();
        info!(charge_id = %charge.charge_id, charge_at = %charge.charge_at, "Recurrent charge created");

        Ok(charge)
    }

    #[instrument(skip(self), fields(charge_id = %charge_id))]
    async fn get_charge(&self, charge_id: Uuid) -> Result<Option<RecurrentCharge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_charge"])
            .start_timer();

        let charge = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            SELECT {CHARGE_COLUMNS}
            FROM recurrent_charges rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            WHERE rc.charge_id = $1
            "#
        ))
        .bind(charge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get recurrent charge", e))?;

        timer.observe_duration();

        Ok(charge)
    }

    #[instrument(skip(self), fields(parent_payment_id = %parent_payment_id))]
    async fn latest_charge_for_parent(
        &self,
        parent_payment_id: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_charge_for_parent"])
            .start_timer();

        let charge = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            SELECT {CHARGE_COLUMNS}
            FROM recurrent_charges rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            WHERE rc.parent_payment_id = $1
            ORDER BY rc.created_utc DESC
            LIMIT 1
            "#
        ))
        .bind(parent_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get charge for parent", e))?;

        timer.observe_duration();

        Ok(charge)
    }

    #[instrument(skip(self, charge), fields(charge_id = %charge.charge_id, state = %charge.state))]
    async fn save_charge(&self, charge: &RecurrentCharge) -> Result<RecurrentCharge, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_charge"])
            .start_timer();

        let saved = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            WITH rc AS (
                UPDATE recurrent_charges
                SET state = $2,
                    status = $3,
                    payment_id = $4,
                    retries = $5,
                    charge_at = $6,
                    note = $7
                WHERE charge_id = $1
                RETURNING *
            )
            SELECT {CHARGE_COLUMNS}
            FROM rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            "#
        ))
        .bind(charge.charge_id)
        .bind(charge.state)
        .bind(&charge.status)
        .bind(charge.payment_id)
        .bind(charge.retries)
        .bind(charge.charge_at)
        .bind(&charge.note)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save recurrent charge", e))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Recurrent charge {} not found",
                charge.charge_id
            ))
        })?;

        timer.observe_duration();

        Ok(saved)
    }

    #[instrument(skip(self, ids))]
    async fn find_chargeable(
        &self,
        due_before: DateTime<Utc>,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrentCharge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_chargeable"])
            .start_timer();

        let ids: Option<Vec<Uuid>> = ids.map(|ids| ids.to_vec());

        let charges = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            SELECT {CHARGE_COLUMNS}
            FROM recurrent_charges rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            WHERE rc.state = $1
              AND rc.status IS NULL
              AND rc.retries >= 0
              AND rc.charge_at <= $2
              AND ($3::uuid[] IS NULL OR rc.charge_id = ANY($3))
            ORDER BY random()
            "#
        ))
        .bind(RecurrentChargeState::Active)
        .bind(due_before)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find chargeable attempts", e))?;

        timer.observe_duration();

        Ok(charges)
    }

    #[instrument(skip(self), fields(method_id = %method_id))]
    async fn last_charged_for_method(
        &self,
        method_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["last_charged_for_method"])
            .start_timer();

        let charge = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            SELECT {CHARGE_COLUMNS}
            FROM recurrent_charges rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            WHERE rc.method_id = $1
              AND rc.state = $2
              AND rc.charge_id <> $3
            ORDER BY rc.charge_at DESC
            LIMIT 1
            "#
        ))
        .bind(method_id)
        .bind(RecurrentChargeState::Charged)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get last charged attempt", e))?;

        timer.observe_duration();

        Ok(charge)
    }

    #[instrument(skip(self, external_token))]
    async fn latest_charge_for_token_after(
        &self,
        external_token: &str,
        after: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_charge_for_token_after"])
            .start_timer();

        let charge = sqlx::query_as::<_, RecurrentCharge>(&format!(
            r#"
            SELECT {CHARGE_COLUMNS}
            FROM recurrent_charges rc
            JOIN stored_payment_methods m ON m.method_id = rc.method_id
            WHERE m.external_token = $1
              AND rc.charge_at > $2
              AND rc.charge_id <> $3
            ORDER BY rc.charge_at DESC
            LIMIT 1
            "#
        ))
        .bind(external_token)
        .bind(after)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get successor attempt", e))?;

        timer.observe_duration();

        Ok(charge)
    }

    // =========================================================================
    // Audit Log Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(payment_id = %input.payment_id, success = input.success))]
    async fn append_log(&self, input: &CreatePaymentLog) -> Result<PaymentLog, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_log"])
            .start_timer();

        let log = sqlx::query_as::<_, PaymentLog>(&format!(
            r#"
            INSERT INTO payment_logs (log_id, payment_id, charge_id, success, result_code, result_message, response)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.payment_id)
        .bind(input.charge_id)
        .bind(input.success)
        .bind(&input.result_code)
        .bind(&input.result_message)
        .bind(&input.response)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to append payment log", e))?;

        timer.observe_duration();

        Ok(log)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_logs(&self, payment_id: Uuid) -> Result<Vec<PaymentLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_logs"])
            .start_timer();

        let logs = sqlx::query_as::<_, PaymentLog>(&format!(
            "SELECT {LOG_COLUMNS} FROM payment_logs WHERE payment_id = $1 ORDER BY created_utc"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list payment logs", e))?;

        timer.observe_duration();

        Ok(logs)
    }
}
