use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgExecutor;

pub mod models;

pub use models::*;

/// Create the database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============ Scalar app state ============

/// Read an integer state value.
pub async fn get_state_int(db: impl PgExecutor<'_>, k: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(r#"SELECT v FROM app_state_int WHERE k = $1"#)
        .bind(k)
        .fetch_optional(db)
        .await
        .wrap_err_with(|| format!("Failed to read app_state_int {k}"))?;
    Ok(row.map(|r| r.0))
}

/// Read an integer state value that must exist.
pub async fn require_state_int(db: impl PgExecutor<'_>, k: &str) -> Result<i64> {
    get_state_int(db, k)
        .await?
        .ok_or_else(|| eyre::eyre!("missing app_state_int key {k}"))
}

/// Unconditional upsert of an integer state value.
pub async fn set_state_int(db: impl PgExecutor<'_>, k: &str, v: i64) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO app_state_int (k, v) VALUES ($1, $2)
           ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v"#,
    )
    .bind(k)
    .bind(v)
    .execute(db)
    .await
    .wrap_err_with(|| format!("Failed to set app_state_int {k}"))?;
    Ok(())
}

/// Insert an integer state value only if the key does not exist yet.
pub async fn init_state_int(db: impl PgExecutor<'_>, k: &str, v: i64) -> Result<()> {
    sqlx::query(r#"INSERT INTO app_state_int (k, v) VALUES ($1, $2) ON CONFLICT (k) DO NOTHING"#)
        .bind(k)
        .bind(v)
        .execute(db)
        .await
        .wrap_err_with(|| format!("Failed to init app_state_int {k}"))?;
    Ok(())
}

/// Monotonic cursor advance: only writes when the new value is greater.
/// A slower concurrent writer becomes a no-op.
pub async fn advance_state_int(db: impl PgExecutor<'_>, k: &str, v: i64) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO app_state_int (k, v) VALUES ($1, $2)
           ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v
           WHERE app_state_int.v < EXCLUDED.v"#,
    )
    .bind(k)
    .bind(v)
    .execute(db)
    .await
    .wrap_err_with(|| format!("Failed to advance app_state_int {k}"))?;
    Ok(())
}

/// Insert a string state value only if the key does not exist yet.
pub async fn init_state_str(db: impl PgExecutor<'_>, k: &str, v: &str) -> Result<()> {
    sqlx::query(r#"INSERT INTO app_state_str (k, v) VALUES ($1, $2) ON CONFLICT (k) DO NOTHING"#)
        .bind(k)
        .bind(v)
        .execute(db)
        .await
        .wrap_err_with(|| format!("Failed to init app_state_str {k}"))?;
    Ok(())
}

/// Read a string state value.
pub async fn get_state_str(db: impl PgExecutor<'_>, k: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(r#"SELECT v FROM app_state_str WHERE k = $1"#)
        .bind(k)
        .fetch_optional(db)
        .await
        .wrap_err_with(|| format!("Failed to read app_state_str {k}"))?;
    Ok(row.map(|r| r.0))
}

/// Read a string state value that must exist and be non-empty.
pub async fn require_state_str(db: impl PgExecutor<'_>, k: &str) -> Result<String> {
    match get_state_str(db, k).await? {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(eyre::eyre!("missing app_state_str key {k}")),
    }
}

/// Unconditional upsert of a string state value.
pub async fn set_state_str(db: impl PgExecutor<'_>, k: &str, v: &str) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO app_state_str (k, v) VALUES ($1, $2)
           ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v"#,
    )
    .bind(k)
    .bind(v)
    .execute(db)
    .await
    .wrap_err_with(|| format!("Failed to set app_state_str {k}"))?;
    Ok(())
}

// ============ Addresses ============

const ADDRESS_SELECT: &str = r#"id, symbol, address, encrypted_key, use_tag"#;

/// Count unassigned addresses for a symbol.
pub async fn count_free_addresses(db: impl PgExecutor<'_>, symbol: &str) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM addresses WHERE symbol = $1 AND use_tag = 0"#)
            .bind(symbol)
            .fetch_one(db)
            .await
            .wrap_err("Failed to count free addresses")?;
    Ok(row.0)
}

/// Insert one issued address.
pub async fn insert_address(
    db: impl PgExecutor<'_>,
    symbol: &str,
    address: &str,
    encrypted_key: &str,
    use_tag: i64,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO addresses (symbol, address, encrypted_key, use_tag)
           VALUES ($1, $2, $3, $4) ON CONFLICT (address) DO NOTHING"#,
    )
    .bind(symbol)
    .bind(address)
    .bind(encrypted_key)
    .bind(use_tag)
    .execute(db)
    .await
    .wrap_err("Failed to insert address")?;
    Ok(())
}

/// Look up issued addresses among an arbitrary address list.
pub async fn addresses_in(db: impl PgExecutor<'_>, list: &[String]) -> Result<Vec<AddressRow>> {
    if list.is_empty() {
        return Ok(vec![]);
    }
    let query = format!("SELECT {ADDRESS_SELECT} FROM addresses WHERE address = ANY($1)");
    sqlx::query_as::<_, AddressRow>(&query)
        .bind(list)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select addresses")
}

/// All internal (hot/fee) addresses of a symbol.
pub async fn internal_addresses(db: impl PgExecutor<'_>, symbol: &str) -> Result<Vec<AddressRow>> {
    let query =
        format!("SELECT {ADDRESS_SELECT} FROM addresses WHERE symbol = $1 AND use_tag = -1");
    sqlx::query_as::<_, AddressRow>(&query)
        .bind(symbol)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select internal addresses")
}

/// Sealed key for a single address.
pub async fn encrypted_key_for(db: impl PgExecutor<'_>, address: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT encrypted_key FROM addresses WHERE address = $1"#)
            .bind(address)
            .fetch_optional(db)
            .await
            .wrap_err("Failed to read address key")?;
    Ok(row.map(|r| r.0))
}

// ============ Products ============

pub async fn products_by_ids(db: impl PgExecutor<'_>, ids: &[i64]) -> Result<Vec<Product>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    sqlx::query_as::<_, Product>(
        r#"SELECT id, app_name, cb_url, app_sk FROM products WHERE id = ANY($1)"#,
    )
    .bind(ids)
    .fetch_all(db)
    .await
    .wrap_err("Failed to select products")
}

// ============ BTC deposits ============

const BTC_DEPOSIT_SELECT: &str = r#"id, product_id, block_hash, tx_id, vout_n, address,
    value::TEXT as value, handle_status"#;

/// Insert a deposit; re-processing the same block is a no-op thanks to the
/// (tx_id, vout_n) natural key.
pub async fn insert_btc_deposit(db: impl PgExecutor<'_>, dep: &NewBtcDeposit) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO btc_deposits (product_id, block_hash, tx_id, vout_n, address, value)
           VALUES ($1, $2, $3, $4, $5, $6::NUMERIC)
           ON CONFLICT (tx_id, vout_n) DO NOTHING"#,
    )
    .bind(dep.product_id)
    .bind(&dep.block_hash)
    .bind(&dep.tx_id)
    .bind(dep.vout_n)
    .bind(&dep.address)
    .bind(&dep.value)
    .execute(db)
    .await
    .wrap_err("Failed to insert BTC deposit")?;
    Ok(res.rows_affected() > 0)
}

pub async fn btc_deposits_by_status(
    db: impl PgExecutor<'_>,
    status: &str,
) -> Result<Vec<BtcDeposit>> {
    let query = format!("SELECT {BTC_DEPOSIT_SELECT} FROM btc_deposits WHERE handle_status = $1");
    sqlx::query_as::<_, BtcDeposit>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select BTC deposits")
}

pub async fn update_btc_deposits_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE btc_deposits SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update BTC deposit status")?;
    Ok(())
}

// ============ BTC UTXOs ============

const BTC_UTXO_SELECT: &str = r#"id, utxo_type, block_hash, tx_id, vout_n, address,
    value::TEXT as value, script, spend_tx_id, spend_n, handle_status"#;

/// Insert a tracked UTXO. A predictive insert from the broadcaster has an
/// empty block hash; the block seeker's later pass fills it in.
pub async fn insert_btc_utxo(db: impl PgExecutor<'_>, utxo: &NewBtcUtxo) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO btc_utxos (utxo_type, block_hash, tx_id, vout_n, address, value, script)
           VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7)
           ON CONFLICT (tx_id, vout_n) DO UPDATE SET
               block_hash = EXCLUDED.block_hash,
               updated_at = NOW()
           WHERE btc_utxos.block_hash = '' AND EXCLUDED.block_hash <> ''"#,
    )
    .bind(&utxo.utxo_type)
    .bind(&utxo.block_hash)
    .bind(&utxo.tx_id)
    .bind(utxo.vout_n)
    .bind(&utxo.address)
    .bind(&utxo.value)
    .bind(&utxo.script)
    .execute(db)
    .await
    .wrap_err("Failed to insert BTC utxo")?;
    Ok(())
}

/// Identity rows for UTXOs created by any of the given transactions.
pub async fn utxo_keys_by_txids(
    db: impl PgExecutor<'_>,
    txids: &[String],
) -> Result<Vec<UtxoKeyRow>> {
    if txids.is_empty() {
        return Ok(vec![]);
    }
    sqlx::query_as::<_, UtxoKeyRow>(
        r#"SELECT id, tx_id, vout_n FROM btc_utxos WHERE tx_id = ANY($1)"#,
    )
    .bind(txids)
    .fetch_all(db)
    .await
    .wrap_err("Failed to select utxos by txids")
}

/// Record an on-chain spend observed by the block seeker. Rows already
/// consumed by our own planner stay `used`.
pub async fn mark_utxo_spend_observed(
    db: impl PgExecutor<'_>,
    id: i64,
    spend_tx_id: &str,
    spend_n: i64,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE btc_utxos
           SET spend_tx_id = $1, spend_n = $2, handle_status = $3, updated_at = NOW()
           WHERE id = $4 AND handle_status = $5"#,
    )
    .bind(spend_tx_id)
    .bind(spend_n)
    .bind(crate::types::UtxoStatus::Confirmed.as_str())
    .bind(id)
    .bind(crate::types::UtxoStatus::Init.as_str())
    .execute(db)
    .await
    .wrap_err("Failed to mark utxo spend observed")?;
    Ok(())
}

/// Consume a UTXO for a planned transaction (predictive spend).
pub async fn mark_utxo_used(
    db: impl PgExecutor<'_>,
    id: i64,
    spend_tx_id: &str,
    spend_n: i64,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE btc_utxos
           SET spend_tx_id = $1, spend_n = $2, handle_status = $3, updated_at = NOW()
           WHERE id = $4"#,
    )
    .bind(spend_tx_id)
    .bind(spend_n)
    .bind(crate::types::UtxoStatus::Used.as_str())
    .bind(id)
    .execute(db)
    .await
    .wrap_err("Failed to mark utxo used")?;
    Ok(())
}

/// Row-lock every sweepable tenant-deposit UTXO.
pub async fn utxos_for_sweep_for_update(db: impl PgExecutor<'_>) -> Result<Vec<BtcUtxo>> {
    let query = format!(
        "SELECT {BTC_UTXO_SELECT} FROM btc_utxos
         WHERE utxo_type = 'tx' AND handle_status = 'init'
         ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, BtcUtxo>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock sweep utxos")
}

/// Row-lock spendable UTXOs of one type at one address, insertion order.
pub async fn utxos_by_address_type_for_update(
    db: impl PgExecutor<'_>,
    address: &str,
    utxo_type: &str,
) -> Result<Vec<BtcUtxo>> {
    let query = format!(
        "SELECT {BTC_UTXO_SELECT} FROM btc_utxos
         WHERE address = $1 AND utxo_type = $2 AND handle_status = 'init'
         ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, BtcUtxo>(&query)
        .bind(address)
        .bind(utxo_type)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock utxos by address")
}

/// Row-lock spendable UTXOs of one type across several addresses.
pub async fn utxos_by_addresses_type_for_update(
    db: impl PgExecutor<'_>,
    addresses: &[String],
    utxo_type: &str,
) -> Result<Vec<BtcUtxo>> {
    if addresses.is_empty() {
        return Ok(vec![]);
    }
    let query = format!(
        "SELECT {BTC_UTXO_SELECT} FROM btc_utxos
         WHERE address = ANY($1) AND utxo_type = $2 AND handle_status = 'init'
         ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, BtcUtxo>(&query)
        .bind(addresses)
        .bind(utxo_type)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock utxos by addresses")
}

// ============ BTC sends ============

const BTC_SEND_SELECT: &str = r#"id, related_type, related_id, token_id, tx_id, from_address,
    to_address, balance::TEXT as balance, gas, gas_price, hex, handle_status"#;

pub async fn insert_btc_send(db: impl PgExecutor<'_>, send: &NewBtcSend) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO btc_sends
           (related_type, related_id, token_id, tx_id, from_address, to_address, balance,
            gas, gas_price, hex)
           VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9, $10)"#,
    )
    .bind(&send.related_type)
    .bind(send.related_id)
    .bind(send.token_id)
    .bind(&send.tx_id)
    .bind(&send.from_address)
    .bind(&send.to_address)
    .bind(&send.balance)
    .bind(send.gas)
    .bind(send.gas_price)
    .bind(&send.hex)
    .execute(db)
    .await
    .wrap_err("Failed to insert BTC send")?;
    Ok(())
}

pub async fn btc_sends_by_status(db: impl PgExecutor<'_>, status: &str) -> Result<Vec<BtcSend>> {
    let query =
        format!("SELECT {BTC_SEND_SELECT} FROM btc_sends WHERE handle_status = $1 ORDER BY id");
    sqlx::query_as::<_, BtcSend>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select BTC sends")
}

pub async fn update_btc_sends_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE btc_sends SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update BTC send status")?;
    Ok(())
}

/// Sum of token amounts still being withdrawn from a token hot address
/// (leaders not yet confirmed). Used for balance reservation.
pub async fn btc_pending_token_sum(
    db: impl PgExecutor<'_>,
    hot_address: &str,
    token_index: i64,
) -> Result<String> {
    let row: (Option<String>,) = sqlx::query_as(
        r#"SELECT SUM(balance)::TEXT FROM btc_sends
           WHERE related_type = 'withdraw' AND token_id = $1 AND from_address = $2
             AND handle_status IN ('init', 'send') AND hex <> ''"#,
    )
    .bind(token_index)
    .bind(hot_address)
    .fetch_one(db)
    .await
    .wrap_err("Failed to sum pending token sends")?;
    Ok(row.0.unwrap_or_else(|| "0".to_string()))
}

// ============ ETH sends ============

const ETH_SEND_SELECT: &str = r#"id, related_type, related_id, token_id, tx_id, from_address,
    to_address, balance::TEXT as balance, gas, gas_price, nonce, hex, handle_status"#;

pub async fn insert_eth_send(db: impl PgExecutor<'_>, send: &NewEthSend) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO eth_sends
           (related_type, related_id, token_id, tx_id, from_address, to_address, balance,
            gas, gas_price, nonce, hex)
           VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9, $10, $11)"#,
    )
    .bind(&send.related_type)
    .bind(send.related_id)
    .bind(send.token_id)
    .bind(&send.tx_id)
    .bind(&send.from_address)
    .bind(&send.to_address)
    .bind(&send.balance)
    .bind(send.gas)
    .bind(send.gas_price)
    .bind(send.nonce)
    .bind(&send.hex)
    .execute(db)
    .await
    .wrap_err("Failed to insert ETH send")?;
    Ok(())
}

pub async fn eth_sends_by_status(db: impl PgExecutor<'_>, status: &str) -> Result<Vec<EthSend>> {
    let query =
        format!("SELECT {ETH_SEND_SELECT} FROM eth_sends WHERE handle_status = $1 ORDER BY id");
    sqlx::query_as::<_, EthSend>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select ETH sends")
}

pub async fn update_eth_sends_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE eth_sends SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update ETH send status")?;
    Ok(())
}

/// Highest nonce this service has ever reserved for an address. Inserted
/// Send rows are visible to the next call within the same transaction,
/// which is what makes allocation gap-free.
pub async fn max_eth_send_nonce(db: impl PgExecutor<'_>, from: &str) -> Result<Option<i64>> {
    let row: (Option<i64>,) =
        sqlx::query_as(r#"SELECT MAX(nonce) FROM eth_sends WHERE from_address = $1 AND nonce >= 0"#)
            .bind(from)
            .fetch_one(db)
            .await
            .wrap_err("Failed to read max send nonce")?;
    Ok(row.0)
}

/// ETH leaving an address in not-yet-confirmed sends (leaders only).
pub async fn eth_pending_sum(db: impl PgExecutor<'_>, from: &str) -> Result<String> {
    let row: (Option<String>,) = sqlx::query_as(
        r#"SELECT SUM(balance)::TEXT FROM eth_sends
           WHERE from_address = $1 AND handle_status IN ('init', 'send') AND hex <> ''"#,
    )
    .bind(from)
    .fetch_one(db)
    .await
    .wrap_err("Failed to sum pending ETH sends")?;
    Ok(row.0.unwrap_or_else(|| "0".to_string()))
}

// ============ Withdraws ============

const WITHDRAW_SELECT: &str = r#"id, product_id, out_serial, symbol, to_address,
    balance::TEXT as balance, tx_hash, handle_status, created_at"#;

pub async fn withdraws_by_status(
    db: impl PgExecutor<'_>,
    status: &str,
    symbols: &[String],
) -> Result<Vec<Withdraw>> {
    if symbols.is_empty() {
        return Ok(vec![]);
    }
    let query = format!(
        "SELECT {WITHDRAW_SELECT} FROM withdraws
         WHERE handle_status = $1 AND symbol = ANY($2) ORDER BY id"
    );
    sqlx::query_as::<_, Withdraw>(&query)
        .bind(status)
        .bind(symbols)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select withdraws")
}

/// Row-locked variant for the planners.
pub async fn withdraws_by_status_for_update(
    db: impl PgExecutor<'_>,
    status: &str,
    symbols: &[String],
) -> Result<Vec<Withdraw>> {
    if symbols.is_empty() {
        return Ok(vec![]);
    }
    let query = format!(
        "SELECT {WITHDRAW_SELECT} FROM withdraws
         WHERE handle_status = $1 AND symbol = ANY($2) ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, Withdraw>(&query)
        .bind(status)
        .bind(symbols)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock withdraws")
}

/// Row-lock a single withdrawal still in the given status.
pub async fn withdraw_by_id_for_update(
    db: impl PgExecutor<'_>,
    id: i64,
    status: &str,
) -> Result<Option<Withdraw>> {
    let query = format!(
        "SELECT {WITHDRAW_SELECT} FROM withdraws
         WHERE id = $1 AND handle_status = $2 FOR UPDATE"
    );
    sqlx::query_as::<_, Withdraw>(&query)
        .bind(id)
        .bind(status)
        .fetch_optional(db)
        .await
        .wrap_err("Failed to lock withdraw")
}

pub async fn withdraws_by_ids(db: impl PgExecutor<'_>, ids: &[i64]) -> Result<Vec<Withdraw>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let query = format!("SELECT {WITHDRAW_SELECT} FROM withdraws WHERE id = ANY($1)");
    sqlx::query_as::<_, Withdraw>(&query)
        .bind(ids)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select withdraws by ids")
}

/// Attach the planned transaction hash and move to `hex`.
pub async fn update_withdraw_gen_tx(
    db: impl PgExecutor<'_>,
    id: i64,
    tx_hash: &str,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE withdraws SET tx_hash = $1, handle_status = 'hex', updated_at = NOW()
           WHERE id = $2"#,
    )
    .bind(tx_hash)
    .bind(id)
    .execute(db)
    .await
    .wrap_err("Failed to update withdraw tx hash")?;
    Ok(())
}

pub async fn update_withdraws_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE withdraws SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update withdraw status")?;
    Ok(())
}

// ============ OMNI deposits ============

const OMNI_DEPOSIT_SELECT: &str = r#"id, product_id, token_index, token_symbol, block_hash,
    tx_id, from_address, to_address, value::TEXT as value, handle_status, org_status"#;

pub async fn insert_omni_deposit(db: impl PgExecutor<'_>, dep: &NewOmniDeposit) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO omni_deposits
           (product_id, token_index, token_symbol, block_hash, tx_id, from_address, to_address, value)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC)
           ON CONFLICT (tx_id) DO NOTHING"#,
    )
    .bind(dep.product_id)
    .bind(dep.token_index)
    .bind(&dep.token_symbol)
    .bind(&dep.block_hash)
    .bind(&dep.tx_id)
    .bind(&dep.from_address)
    .bind(&dep.to_address)
    .bind(&dep.value)
    .execute(db)
    .await
    .wrap_err("Failed to insert OMNI deposit")?;
    Ok(res.rows_affected() > 0)
}

pub async fn omni_deposits_by_handle_status(
    db: impl PgExecutor<'_>,
    status: &str,
) -> Result<Vec<OmniDeposit>> {
    let query = format!("SELECT {OMNI_DEPOSIT_SELECT} FROM omni_deposits WHERE handle_status = $1");
    sqlx::query_as::<_, OmniDeposit>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select OMNI deposits")
}

pub async fn update_omni_deposits_handle_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE omni_deposits SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update OMNI deposit handle status")?;
    Ok(())
}

/// Row-lock OMNI deposits awaiting sweep.
pub async fn omni_deposits_for_org_for_update(
    db: impl PgExecutor<'_>,
) -> Result<Vec<OmniDeposit>> {
    let query = format!(
        "SELECT {OMNI_DEPOSIT_SELECT} FROM omni_deposits
         WHERE org_status = 'init' ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, OmniDeposit>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock OMNI deposits for sweep")
}

pub async fn update_omni_deposits_org_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE omni_deposits SET org_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update OMNI deposit org status")?;
    Ok(())
}

// ============ ETH deposits ============

const ETH_DEPOSIT_SELECT: &str = r#"id, product_id, tx_id, from_address, to_address,
    value::TEXT as value, handle_status, org_status"#;

pub async fn insert_eth_deposit(db: impl PgExecutor<'_>, dep: &NewEthDeposit) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO eth_deposits (product_id, tx_id, from_address, to_address, value)
           VALUES ($1, $2, $3, $4, $5::NUMERIC)
           ON CONFLICT (tx_id) DO NOTHING"#,
    )
    .bind(dep.product_id)
    .bind(&dep.tx_id)
    .bind(&dep.from_address)
    .bind(&dep.to_address)
    .bind(&dep.value)
    .execute(db)
    .await
    .wrap_err("Failed to insert ETH deposit")?;
    Ok(res.rows_affected() > 0)
}

pub async fn eth_deposits_by_handle_status(
    db: impl PgExecutor<'_>,
    status: &str,
) -> Result<Vec<EthDeposit>> {
    let query = format!("SELECT {ETH_DEPOSIT_SELECT} FROM eth_deposits WHERE handle_status = $1");
    sqlx::query_as::<_, EthDeposit>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select ETH deposits")
}

pub async fn update_eth_deposits_handle_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE eth_deposits SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update ETH deposit handle status")?;
    Ok(())
}

/// Row-lock ETH deposits awaiting sweep.
pub async fn eth_deposits_for_org_for_update(db: impl PgExecutor<'_>) -> Result<Vec<EthDeposit>> {
    let query = format!(
        "SELECT {ETH_DEPOSIT_SELECT} FROM eth_deposits
         WHERE org_status = 'init' ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, EthDeposit>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock ETH deposits for sweep")
}

pub async fn update_eth_deposits_org_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE eth_deposits SET org_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update ETH deposit org status")?;
    Ok(())
}

// ============ ERC-20 deposits ============

const ERC20_DEPOSIT_SELECT: &str = r#"id, token_id, product_id, tx_id, from_address, to_address,
    value::TEXT as value, handle_status, org_status"#;

pub async fn insert_erc20_deposit(db: impl PgExecutor<'_>, dep: &NewErc20Deposit) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO erc20_deposits (token_id, product_id, tx_id, from_address, to_address, value)
           VALUES ($1, $2, $3, $4, $5, $6::NUMERIC)
           ON CONFLICT (tx_id) DO NOTHING"#,
    )
    .bind(dep.token_id)
    .bind(dep.product_id)
    .bind(&dep.tx_id)
    .bind(&dep.from_address)
    .bind(&dep.to_address)
    .bind(&dep.value)
    .execute(db)
    .await
    .wrap_err("Failed to insert ERC-20 deposit")?;
    Ok(res.rows_affected() > 0)
}

pub async fn erc20_deposits_by_handle_status(
    db: impl PgExecutor<'_>,
    status: &str,
) -> Result<Vec<Erc20Deposit>> {
    let query =
        format!("SELECT {ERC20_DEPOSIT_SELECT} FROM erc20_deposits WHERE handle_status = $1");
    sqlx::query_as::<_, Erc20Deposit>(&query)
        .bind(status)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select ERC-20 deposits")
}

pub async fn update_erc20_deposits_handle_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE erc20_deposits SET handle_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update ERC-20 deposit handle status")?;
    Ok(())
}

/// Row-lock ERC-20 deposits ready for the sweep planner: fresh groups plus
/// groups whose fee funding just confirmed.
pub async fn erc20_deposits_for_org_for_update(
    db: impl PgExecutor<'_>,
) -> Result<Vec<Erc20Deposit>> {
    let query = format!(
        "SELECT {ERC20_DEPOSIT_SELECT} FROM erc20_deposits
         WHERE org_status IN ('init', 'fee_confirm') ORDER BY id FOR UPDATE"
    );
    sqlx::query_as::<_, Erc20Deposit>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to lock ERC-20 deposits for sweep")
}

pub async fn update_erc20_deposits_org_status(
    db: impl PgExecutor<'_>,
    ids: &[i64],
    status: &str,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"UPDATE erc20_deposits SET org_status = $1, updated_at = NOW() WHERE id = ANY($2)"#,
    )
    .bind(status)
    .bind(ids)
    .execute(db)
    .await
    .wrap_err("Failed to update ERC-20 deposit org status")?;
    Ok(())
}

// ============ Notifications ============

pub async fn insert_notification(db: impl PgExecutor<'_>, n: &NewNotification) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO notifications
           (nonce, product_id, item_type, item_id, notify_type, token_symbol, url, msg)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&n.nonce)
    .bind(n.product_id)
    .bind(&n.item_type)
    .bind(n.item_id)
    .bind(&n.notify_type)
    .bind(&n.token_symbol)
    .bind(&n.url)
    .bind(&n.msg)
    .execute(db)
    .await
    .wrap_err("Failed to insert notification")?;
    Ok(())
}

// ============ Token configuration ============

const ERC20_TOKEN_SELECT: &str = r#"id, token_address, token_decimals, token_symbol,
    cold_address, hot_address, org_min_balance::TEXT as org_min_balance"#;

pub async fn erc20_tokens_all(db: impl PgExecutor<'_>) -> Result<Vec<Erc20Token>> {
    let query = format!("SELECT {ERC20_TOKEN_SELECT} FROM erc20_tokens ORDER BY id");
    sqlx::query_as::<_, Erc20Token>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select ERC-20 tokens")
}

pub async fn erc20_tokens_by_ids(db: impl PgExecutor<'_>, ids: &[i64]) -> Result<Vec<Erc20Token>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let query = format!("SELECT {ERC20_TOKEN_SELECT} FROM erc20_tokens WHERE id = ANY($1)");
    sqlx::query_as::<_, Erc20Token>(&query)
        .bind(ids)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select ERC-20 tokens by ids")
}

const OMNI_TOKEN_SELECT: &str = r#"id, token_index, token_symbol, cold_address, hot_address,
    fee_address, tx_org_min_balance::TEXT as tx_org_min_balance"#;

pub async fn omni_tokens_all(db: impl PgExecutor<'_>) -> Result<Vec<OmniToken>> {
    let query = format!("SELECT {OMNI_TOKEN_SELECT} FROM omni_tokens ORDER BY id");
    sqlx::query_as::<_, OmniToken>(&query)
        .fetch_all(db)
        .await
        .wrap_err("Failed to select OMNI tokens")
}

// ============ Status / API queries ============

pub async fn count_by_status(
    db: impl PgExecutor<'_>,
    table: &str,
    column: &str,
    status: &str,
) -> Result<i64> {
    // table/column names come from a fixed in-code list, never from input
    let query = format!("SELECT COUNT(*) FROM {table} WHERE {column} = $1");
    let row: (i64,) = sqlx::query_as(&query)
        .bind(status)
        .fetch_one(db)
        .await
        .wrap_err_with(|| format!("Failed to count {table} rows"))?;
    Ok(row.0)
}

/// Queue counts surfaced on the status endpoint.
#[derive(Debug, Default, serde::Serialize)]
pub struct QueueCounts {
    pub btc_sends_init: i64,
    pub eth_sends_init: i64,
    pub btc_sends_unconfirmed: i64,
    pub eth_sends_unconfirmed: i64,
    pub withdraws_init: i64,
    pub notifications_init: i64,
}

pub async fn queue_counts(pool: &PgPool) -> Result<QueueCounts> {
    Ok(QueueCounts {
        btc_sends_init: count_by_status(pool, "btc_sends", "handle_status", "init").await?,
        eth_sends_init: count_by_status(pool, "eth_sends", "handle_status", "init").await?,
        btc_sends_unconfirmed: count_by_status(pool, "btc_sends", "handle_status", "send").await?,
        eth_sends_unconfirmed: count_by_status(pool, "eth_sends", "handle_status", "send").await?,
        withdraws_init: count_by_status(pool, "withdraws", "handle_status", "init").await?,
        notifications_init: count_by_status(pool, "notifications", "handle_status", "init")
            .await?,
    })
}

/// Fetch a product map keyed by id (helper shared by the notifiers).
pub async fn product_map(
    db: impl PgExecutor<'_>,
    ids: &[i64],
) -> Result<std::collections::HashMap<i64, Product>> {
    let rows = products_by_ids(db, ids).await?;
    Ok(rows.into_iter().map(|p| (p.id, p)).collect())
}

/// Fetch a withdraw map keyed by id (helper shared by the broadcasters).
pub async fn withdraw_map(
    db: impl PgExecutor<'_>,
    ids: &[i64],
) -> Result<std::collections::HashMap<i64, Withdraw>> {
    let rows = withdraws_by_ids(db, ids).await?;
    Ok(rows.into_iter().map(|w| (w.id, w)).collect())
}

/// Decrypted-key lookup used by the planners: address → sealed key.
pub async fn encrypted_keys_map(
    db: impl PgExecutor<'_>,
    addresses: &[String],
) -> Result<std::collections::HashMap<String, String>> {
    let rows = addresses_in(db, addresses).await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.address, r.encrypted_key))
        .collect())
}
