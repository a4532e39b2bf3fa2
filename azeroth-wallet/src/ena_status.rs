//! The per-account encrypted balance ledger.
//!
//! An account registered under `ena` owns a list of sCT slots on-chain, one per token it has
//! ever held publicly-shielded. Slot `i` decrypts to `[token_address, token_id, balance]`.

use std::collections::HashMap;
use std::sync::Arc;

use azeroth_crypto::field::{fr_to_hex, fr_to_u128};
use azeroth_crypto::{AuditKey, Fr, SymmetricCiphertext, SymmetricKeyEncryption, UserKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::chain::AzerothChain;
use crate::error::{Result, WalletError};
use crate::types::{fr_to_address, same_address, Address, Token, TxResult};

/// Registration state of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnaState {
    Set,
    NotSet,
    Unknown,
}

/// One decrypted ledger slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnaStatus {
    /// `None` for the native token.
    pub contract_address: Option<Address>,
    pub token_id: Fr,
    pub balance: u128,
    pub sct: SymmetricCiphertext,
}

impl EnaStatus {
    /// A slot the contract has never written; it can take any token.
    pub fn is_unused(&self) -> bool {
        self.sct.is_empty()
    }

    /// Whether this slot holds `token` (or is unused).
    pub fn matches_token(&self, token: &Token) -> bool {
        if self.is_unused() {
            return true;
        }
        let address_matches = match (&self.contract_address, token.kind.is_native()) {
            (None, true) => true,
            (Some(address), false) => same_address(address, &token.contract_address),
            _ => false,
        };
        address_matches && (!token.kind.is_nft() || self.token_id == token.token_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnaSlot {
    pub ena_index: u64,
    pub status: EnaStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetAllEnaStatusResult {
    pub ena_state: EnaState,
    /// Slot count reported by the contract; 0 when it could not be read.
    pub ena_length: u64,
    pub ena_list: Vec<EnaSlot>,
}

impl GetAllEnaStatusResult {
    fn unknown() -> Self {
        Self {
            ena_state: EnaState::Unknown,
            ena_length: 0,
            ena_list: Vec::new(),
        }
    }

    /// The slot holding `token`, else the first unused slot.
    pub fn find(&self, token: &Token) -> Option<&EnaSlot> {
        self.ena_list
            .iter()
            .find(|slot| !slot.status.is_unused() && slot.status.matches_token(token))
            .or_else(|| self.ena_list.iter().find(|slot| slot.status.is_unused()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTRACT READS AND WRITES
// ═══════════════════════════════════════════════════════════════════════════════

/// The auditor's public key; the secret half is never known to a wallet.
pub async fn get_apk(chain: &dyn AzerothChain) -> Result<AuditKey> {
    Ok(AuditKey::public_only(chain.get_apk().await?))
}

pub async fn check_ena_exist(chain: &dyn AzerothChain, address: &str) -> Result<EnaState> {
    let upk = chain.get_user_public_keys(address).await?;
    if upk.ena != Fr::from(0u64) {
        Ok(EnaState::Set)
    } else {
        Ok(EnaState::NotSet)
    }
}

pub async fn get_ena_length(chain: &dyn AzerothChain, ena: &Fr) -> Result<u64> {
    chain.get_ena_length(ena).await
}

/// Fetch and decrypt slot `index`. A slot that does not decrypt to a sensible
/// `[address, id, balance]` triple is `None`.
pub async fn get_ena_index_status(
    chain: &dyn AzerothChain,
    ena: &Fr,
    index: u64,
    sk: &Fr,
) -> Result<Option<EnaStatus>> {
    let sct = chain.get_ciphertext(ena, index).await?;
    Ok(decrypt_slot(sct, sk, index))
}

fn decrypt_slot(sct: SymmetricCiphertext, sk: &Fr, index: u64) -> Option<EnaStatus> {
    if sct.is_empty() {
        return Some(EnaStatus {
            contract_address: None,
            token_id: Fr::from(0u64),
            balance: 0,
            sct,
        });
    }
    let plain = SymmetricKeyEncryption::new(*sk).decrypt(&sct);
    let [address, token_id, balance, ..] = plain.as_slice() else {
        warn!(index, "ledger slot has a short ciphertext");
        return None;
    };
    let Some(balance) = fr_to_u128(balance) else {
        warn!(index, "ledger slot balance does not parse");
        return None;
    };
    let contract_address = if *address == Fr::from(0u64) {
        None
    } else {
        match fr_to_address(address) {
            Some(address) => Some(address),
            None => {
                warn!(index, value = %fr_to_hex(address), "ledger slot address does not parse");
                return None;
            }
        }
    };
    Some(EnaStatus {
        contract_address,
        token_id: *token_id,
        balance,
        sct,
    })
}

/// Send `registerUser` for `user_key`.
pub async fn register_ena(
    chain: &dyn AzerothChain,
    sender: &str,
    user_key: &UserKey,
) -> Result<TxResult> {
    info!(sender, "registering ena");
    let result = chain.register_user(&user_key.pk, sender).await?;
    if let Some(error) = &result.error {
        warn!(sender, error = %error, over_shot = result.over_shot(), "registerUser reported an error");
    }
    Ok(result)
}

/// Estimated fee of [`register_ena`]; 0 when the estimate fails.
pub async fn register_ena_gas_fee(
    chain: &dyn AzerothChain,
    sender: &str,
    user_key: &UserKey,
) -> u128 {
    match chain.estimate_register_user(&user_key.pk, sender).await {
        Ok(estimation) => estimation.gas_fee,
        Err(e) => {
            warn!(sender, error = %e, "registerUser gas estimation failed");
            0
        }
    }
}

/// Read every slot of the account. Failures degrade the result instead of failing it.
pub async fn get_all_ena_status_run(
    chain: &dyn AzerothChain,
    user_key: &UserKey,
    address: &str,
) -> GetAllEnaStatusResult {
    let mut result = GetAllEnaStatusResult::unknown();

    result.ena_state = match check_ena_exist(chain, address).await {
        Ok(state) => state,
        Err(e) => {
            warn!(address, error = %e, "checkEnaExist failed");
            return result;
        }
    };
    if result.ena_state != EnaState::Set {
        return result;
    }

    let length = match get_ena_length(chain, &user_key.ena()).await {
        Ok(length) => length,
        Err(e) => {
            warn!(address, error = %e, "getEnaLength failed");
            return result;
        }
    };
    result.ena_length = length;
    debug!(address, length, "scanning ledger slots");

    let ena = user_key.ena();
    let fetches = (0..length).map(|ena_index| async move {
        (ena_index, get_ena_index_status(chain, &ena, ena_index, &user_key.sk).await)
    });
    for (ena_index, fetched) in futures::future::join_all(fetches).await {
        match fetched {
            Ok(Some(status)) => result.ena_list.push(EnaSlot { ena_index, status }),
            Ok(None) => {}
            Err(e) => warn!(address, ena_index, error = %e, "ledger slot fetch failed"),
        }
    }
    result
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINGLE-FLIGHT REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

type Waiters = Vec<oneshot::Sender<Arc<GetAllEnaStatusResult>>>;

/// De-duplicates concurrent full ledger scans of one account.
///
/// The first caller for a key starts the scan on its own task; callers arriving while it runs
/// are queued, and everyone receives the same `Arc` when it settles.
#[derive(Clone, Default)]
pub struct EnaStatusRegistry {
    in_flight: Arc<Mutex<HashMap<String, Waiters>>>,
}

impl EnaStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scans currently running.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn get_all_ena_status(
        &self,
        chain: Arc<dyn AzerothChain>,
        network_uid: &str,
        address: &str,
        user_key: &UserKey,
    ) -> Result<Arc<GetAllEnaStatusResult>> {
        let key = format!("{network_uid}:{}", fr_to_hex(&user_key.ena()));
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get_mut(&key) {
                Some(waiters) => {
                    debug!(key = %key, "ledger scan already running, waiting");
                    waiters.push(tx);
                    false
                }
                None => {
                    in_flight.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            let registry = self.in_flight.clone();
            let user_key = user_key.clone();
            let address = address.to_string();
            let scan = tokio::spawn(async move {
                get_all_ena_status_run(chain.as_ref(), &user_key, &address).await
            });
            tokio::spawn(async move {
                let outcome = scan.await;
                // the entry goes on every exit so later callers start a fresh scan
                let waiters = registry.lock().await.remove(&key).unwrap_or_default();
                match outcome {
                    Ok(result) => {
                        debug!(key = %key, waiters = waiters.len(), "ledger scan settled");
                        let result = Arc::new(result);
                        for waiter in waiters {
                            let _ = waiter.send(result.clone());
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, waiters = waiters.len(), error = %e, "ledger scan task died");
                    }
                }
            });
        }

        rx.await
            .map_err(|_| WalletError::Task("ledger scan ended without a result".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenKind;
    use azeroth_crypto::field::fr_from_hex;

    fn token(kind: TokenKind, address: &str, id: u64) -> Token {
        Token {
            network_uid: "net".into(),
            token_uid: "t".into(),
            kind,
            contract_address: address.into(),
            token_name: String::new(),
            token_symbol: String::new(),
            decimal: None,
            token_id: Fr::from(id),
        }
    }

    #[test]
    fn test_decrypt_slot_native() {
        let se = SymmetricKeyEncryption::new(Fr::from(7u64));
        let sct = se.encrypt_with_randomness(
            &[Fr::from(0u64), Fr::from(0u64), Fr::from(150u64)],
            Fr::from(5u64),
        );
        let status = decrypt_slot(sct.clone(), &Fr::from(7u64), 0).unwrap();
        assert_eq!(status.contract_address, None);
        assert_eq!(status.balance, 150);
        assert_eq!(status.sct, sct);
        assert_eq!(
            sct.ct[2],
            fr_from_hex("0x2bff32c568d5fe53972bf7e4de6b976235084c87756e0ebcf419eee7f1ba1e74").unwrap()
        );
    }

    #[test]
    fn test_decrypt_slot_erc_and_wrong_key() {
        let se = SymmetricKeyEncryption::new(Fr::from(7u64));
        let sct = se.encrypt(&[Fr::from(0xabcdu64), Fr::from(0u64), Fr::from(1u64)]);
        let status = decrypt_slot(sct.clone(), &Fr::from(7u64), 1).unwrap();
        assert_eq!(
            status.contract_address.as_deref(),
            Some("0x000000000000000000000000000000000000abcd")
        );
        // garbage plaintext does not fit an address and a u128 balance
        assert!(decrypt_slot(sct, &Fr::from(8u64), 1).is_none());
    }

    #[test]
    fn test_matches_token() {
        let erc = "0x000000000000000000000000000000000000abcd";
        let native_slot = EnaStatus {
            contract_address: None,
            token_id: Fr::from(0u64),
            balance: 1,
            sct: SymmetricCiphertext::new(Fr::from(1u64), vec![Fr::from(2u64); 3]),
        };
        let erc_slot = EnaStatus {
            contract_address: Some(erc.into()),
            ..native_slot.clone()
        };
        let zero = "0x0000000000000000000000000000000000000000";

        assert!(native_slot.matches_token(&token(TokenKind::Native, zero, 0)));
        assert!(!native_slot.matches_token(&token(TokenKind::Erc20, erc, 0)));
        assert!(erc_slot.matches_token(&token(
            TokenKind::Erc20,
            "0x000000000000000000000000000000000000ABCD",
            0
        )));
        assert!(!erc_slot.matches_token(&token(TokenKind::Native, zero, 0)));
        assert!(!erc_slot.matches_token(&token(TokenKind::Erc721, erc, 3)));

        let unused = decrypt_slot(SymmetricCiphertext::empty(), &Fr::from(7u64), 0).unwrap();
        assert!(unused.is_unused());
        assert_eq!(unused.balance, 0);
        assert!(unused.matches_token(&token(TokenKind::Erc20, erc, 0)));
    }
}
