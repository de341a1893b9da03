/// Minimum durable shape of the system of record. Idempotent, applied at
/// startup when `--init-schema` is passed to the worker.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS account_balance (
    owner_id BIGINT NOT NULL,
    owner_type TEXT NOT NULL,
    balance NUMERIC(20, 6) NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (owner_id, owner_type)
);

CREATE TABLE IF NOT EXISTS usage_log (
    id BIGSERIAL PRIMARY KEY,
    deduction_id TEXT NOT NULL UNIQUE,
    account_id BIGINT NOT NULL,
    account_type TEXT NOT NULL,
    virtual_key TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    cost NUMERIC(20, 6) NOT NULL,
    currency TEXT NOT NULL,
    input_tokens BIGINT NOT NULL,
    output_tokens BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS usage_log_account_idx
    ON usage_log (account_id, account_type, created_at);

CREATE TABLE IF NOT EXISTS account_balance_audit (
    id BIGSERIAL PRIMARY KEY,
    deduction_id TEXT NOT NULL UNIQUE,
    account_id BIGINT NOT NULL,
    account_type TEXT NOT NULL,
    amount NUMERIC(20, 6) NOT NULL,
    usage_log_id BIGINT NOT NULL REFERENCES usage_log (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS account_balance_audit_account_idx
    ON account_balance_audit (account_id, account_type);

CREATE TABLE IF NOT EXISTS virtual_key (
    token TEXT PRIMARY KEY,
    account_id BIGINT NOT NULL,
    account_type TEXT NOT NULL,
    customer_type_id BIGINT,
    price_override TEXT,
    enabled BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE INDEX IF NOT EXISTS virtual_key_customer_type_idx
    ON virtual_key (customer_type_id);

CREATE TABLE IF NOT EXISTS price_table (
    customer_type_id BIGINT PRIMARY KEY,
    prices TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;
