use rusqlite::Connection;

/// Initialize the database schema
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Accounts (credits_balance is a cache of SUM(ledger_entries.delta))
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            credits_balance INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Ledger (append-only: no UPDATE or DELETE is ever issued)
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            delta INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reason TEXT NOT NULL CHECK (reason IN ('signup_bonus', 'purchase', 'renewal', 'refund', 'task_charge', 'task_refund', 'adjustment')),
            note TEXT,
            event_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_account_time ON ledger_entries(account_id, created_at DESC);

        -- Credit packages, keyed by the payment provider's product id
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            credits INTEGER NOT NULL CHECK (credits >= 0),
            kind TEXT NOT NULL CHECK (kind IN ('one_time', 'subscription')),
            created_at INTEGER NOT NULL
        );

        -- Webhook events (idempotency gate)
        -- UNIQUE(provider, event_id) is what makes duplicate deliveries detectable
        CREATE TABLE IF NOT EXISTS webhook_events (
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_id TEXT,
            payload TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('pending', 'applied', 'skipped')),
            created_at INTEGER NOT NULL,
            PRIMARY KEY (provider, event_id)
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_events_created ON webhook_events(created_at);

        -- Orders (derived from payment events)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            provider_order_id TEXT NOT NULL,
            product_id TEXT,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            credits INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('purchase', 'renewal', 'refund')),
            parent_order_id TEXT REFERENCES orders(id) ON DELETE SET NULL,
            event_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(provider, provider_order_id)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);
        CREATE INDEX IF NOT EXISTS idx_orders_parent ON orders(parent_order_id);

        -- Generation tasks
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            model TEXT NOT NULL,
            input TEXT NOT NULL,
            cost_credits INTEGER NOT NULL CHECK (cost_credits > 0),
            status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            provider_task_id TEXT UNIQUE,
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_account ON tasks(account_id, created_at DESC);

        -- Task outputs (derived from completion events)
        CREATE TABLE IF NOT EXISTS task_outputs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            position INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(task_id, position)
        );
        "#,
    )?;

    Ok(())
}
