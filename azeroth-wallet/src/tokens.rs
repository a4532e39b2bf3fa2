//! Token resolution for received notes.

use azeroth_crypto::field::fr_to_hex;
use azeroth_crypto::Fr;
use tracing::{debug, warn};

use crate::chain::AzerothChain;
use crate::error::Result;
use crate::store::LocalStore;
use crate::types::{address_to_fr, normalize_address, Token, TokenMeta};

/// Store key of a token on a network.
pub fn token_uid(network_uid: &str, contract_address: &str, token_id: &Fr) -> String {
    format!(
        "{network_uid}:{}:{}",
        normalize_address(contract_address),
        fr_to_hex(token_id)
    )
}

fn is_valid_address(address: &str) -> bool {
    let digits = address.strip_prefix("0x").unwrap_or("");
    digits.len() == 40 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

fn token_from_meta(
    network_uid: &str,
    contract_address: &str,
    token_id: Fr,
    meta: TokenMeta,
) -> Token {
    Token {
        network_uid: network_uid.to_string(),
        token_uid: token_uid(network_uid, contract_address, &token_id),
        kind: meta.kind,
        contract_address: normalize_address(contract_address),
        token_name: meta.name,
        token_symbol: meta.symbol,
        decimal: meta.decimal,
        token_id,
    }
}

/// Resolve the token a note refers to.
///
/// The zero address is the network's native token. Other tokens come from the store, or from
/// the chain's metadata calls (and are then added to the store; an NFT's collection entry is
/// added first). `None` when nothing matches.
pub async fn find_token(
    store: &dyn LocalStore,
    chain: &dyn AzerothChain,
    network_uid: &str,
    contract_address: &str,
    token_id: &Fr,
) -> Result<Option<Token>> {
    if address_to_fr(contract_address) == Fr::from(0u64) {
        return store.native_token(network_uid);
    }
    if !is_valid_address(contract_address) {
        warn!(contract_address, "note refers to a malformed token address");
        return Ok(None);
    }
    if let Some(token) = store.find_token(network_uid, contract_address, token_id)? {
        return Ok(Some(token));
    }

    debug!(contract_address, "token unknown locally, fetching metadata");
    let meta = match chain.get_token_meta(contract_address, token_id).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(contract_address, error = %e, "token metadata lookup failed");
            return Ok(None);
        }
    };

    let zero = Fr::from(0u64);
    if meta.kind.is_nft() && *token_id != zero {
        if store.find_token(network_uid, contract_address, &zero)?.is_none() {
            match chain.get_token_meta(contract_address, &zero).await {
                Ok(parent) => {
                    store.add_token(token_from_meta(network_uid, contract_address, zero, parent))?
                }
                Err(e) => {
                    warn!(contract_address, error = %e, "nft collection lookup failed");
                    return Ok(None);
                }
            }
        }
    }

    let token = token_from_meta(network_uid, contract_address, *token_id, meta);
    store.add_token(token.clone())?;
    Ok(Some(token))
}
