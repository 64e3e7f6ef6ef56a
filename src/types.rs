use std::fmt;

/// Asset symbol for native BTC rows in the address table.
pub const BTC_SYMBOL: &str = "btc";
/// Asset symbol for native ETH rows in the address table.
pub const ETH_SYMBOL: &str = "eth";

/// Smallest output value (satoshis) the OMNI reference output may carry.
pub const MIN_NONDUST_OUTPUT: i64 = 546;
/// Hard cap on a packed BTC withdrawal transaction, in bytes.
pub const MAX_TX_SIZE: i64 = 1_000_000;
/// Maximum number of inputs per sweep transaction.
pub const SWEEP_MAX_INPUTS: usize = 5000;
/// Gas used by a plain ETH value transfer.
pub const ETH_TRANSFER_GAS: i64 = 21_000;
/// Script hex prefix of an OMNI OP_RETURN output: OP_RETURN PUSH20 "omni".
pub const OMNI_RETURN_PREFIX: &str = "6a146f6d6e69";

/// Handle status of a detected deposit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositStatus {
    Init,
    Notify,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Init => "init",
            DepositStatus::Notify => "notify",
        }
    }
}

/// Organize (sweep-to-cold) status of a deposit row.
///
/// ERC-20 deposits take the fee-funding detour `init → fee_hex → fee_send
/// → fee_confirm` before re-entering the main branch at `hex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgStatus {
    Init,
    Hex,
    Send,
    Confirm,
    FeeHex,
    FeeSend,
    FeeConfirm,
}

impl OrgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgStatus::Init => "init",
            OrgStatus::Hex => "hex",
            OrgStatus::Send => "send",
            OrgStatus::Confirm => "confirm",
            OrgStatus::FeeHex => "fee_hex",
            OrgStatus::FeeSend => "fee_send",
            OrgStatus::FeeConfirm => "fee_confirm",
        }
    }
}

/// Lifecycle of a tracked UTXO. `spend_tx_id`/`spend_n` are set on `used`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoStatus {
    Init,
    Confirmed,
    Used,
}

impl UtxoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtxoStatus::Init => "init",
            UtxoStatus::Confirmed => "confirmed",
            UtxoStatus::Used => "used",
        }
    }
}

/// Classification of a tracked UTXO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoType {
    /// Tenant deposit output, eligible for sweep-to-cold.
    Tx,
    /// BTC hot wallet output, spendable by the withdrawal planner.
    Hot,
    /// Dust-size OMNI carrier output sitting at a tenant address.
    Omni,
    /// BTC at an OMNI token's hot address, funds withdrawals.
    OmniHot,
    /// BTC at an OMNI token's fee address, funds sweeps.
    OmniOrgFee,
}

impl UtxoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtxoType::Tx => "tx",
            UtxoType::Hot => "hot",
            UtxoType::Omni => "omni",
            UtxoType::OmniHot => "omni_hot",
            UtxoType::OmniOrgFee => "omni_org_fee",
        }
    }
}

/// Withdrawal lifecycle: `init → hex → send → confirm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawStatus {
    Init,
    Hex,
    Send,
    Confirm,
}

impl WithdrawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawStatus::Init => "init",
            WithdrawStatus::Hex => "hex",
            WithdrawStatus::Send => "send",
            WithdrawStatus::Confirm => "confirm",
        }
    }
}

/// Lifecycle of a queued signed transaction (leader and placeholders alike).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Init,
    Send,
    Confirm,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Init => "init",
            SendStatus::Send => "send",
            SendStatus::Confirm => "confirm",
        }
    }
}

/// What a Send row fulfills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedType {
    /// A deposit row being swept to cold (BTC UTXO sweep, ETH sweep).
    Tx,
    /// A tenant withdrawal.
    Withdraw,
    /// An OMNI deposit being swept to cold.
    OmniOrg,
    /// An ERC-20 deposit group token transfer.
    TxErc20,
    /// The ETH fee-funding leg of an ERC-20 sweep.
    TxErc20Fee,
}

impl RelatedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelatedType::Tx => "tx",
            RelatedType::Withdraw => "withdraw",
            RelatedType::OmniOrg => "omni_org",
            RelatedType::TxErc20 => "tx_erc20",
            RelatedType::TxErc20Fee => "tx_erc20_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tx" => Some(RelatedType::Tx),
            "withdraw" => Some(RelatedType::Withdraw),
            "omni_org" => Some(RelatedType::OmniOrg),
            "tx_erc20" => Some(RelatedType::TxErc20),
            "tx_erc20_fee" => Some(RelatedType::TxErc20Fee),
            _ => None,
        }
    }
}

impl fmt::Display for RelatedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    /// Deposit first observed.
    Tx,
    /// Withdrawal broadcast to the network.
    WithdrawSend,
    /// Withdrawal confirmed on chain.
    WithdrawConfirm,
}

impl NotifyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyType::Tx => "tx",
            NotifyType::WithdrawSend => "withdraw_send",
            NotifyType::WithdrawConfirm => "withdraw_confirm",
        }
    }
}

impl fmt::Display for NotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `use_tag` tri-state of an issued address: 0 = unassigned, >0 = assigned
/// to that tenant, -1 = internal hot/fee. Once non-zero it never reverts.
pub const USE_TAG_FREE: i64 = 0;
pub const USE_TAG_INTERNAL: i64 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_type_roundtrip() {
        for rt in [
            RelatedType::Tx,
            RelatedType::Withdraw,
            RelatedType::OmniOrg,
            RelatedType::TxErc20,
            RelatedType::TxErc20Fee,
        ] {
            assert_eq!(RelatedType::parse(rt.as_str()), Some(rt));
        }
        assert_eq!(RelatedType::parse("bogus"), None);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(OrgStatus::FeeConfirm.as_str(), "fee_confirm");
        assert_eq!(UtxoType::OmniOrgFee.as_str(), "omni_org_fee");
        assert_eq!(WithdrawStatus::Hex.as_str(), "hex");
        assert_eq!(SendStatus::Confirm.as_str(), "confirm");
    }

    #[test]
    fn test_omni_marker_prefix() {
        // OP_RETURN (0x6a) + PUSH20 (0x14) + "omni"
        assert!(OMNI_RETURN_PREFIX.starts_with("6a14"));
        assert_eq!(&OMNI_RETURN_PREFIX[4..], hex::encode(b"omni"));
    }
}
