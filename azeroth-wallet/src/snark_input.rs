//! Assembly of the transfer circuit input.
//!
//! One transfer spends at most one note plus a public amount and the account's ledger slot, and
//! produces one new note (to the receiver), a public output and a rewritten ledger slot:
//!
//! ```text
//! new_balance = old_balance + in_private + in_public - out_private - out_public
//! ```
//!
//! The circuit field names (`cm_`, `pv_`, `tk_addr_`, ...) are kept verbatim where they are legal
//! Rust identifiers since they are the wire names of the prover's JSON.

use azeroth_crypto::field::{
    fr_from_biguint, fr_from_u128, fr_to_biguint, fr_to_hex, fr_to_padded_hex,
    random_field_element,
};
use azeroth_crypto::{
    AffinePoint, AuditKey, Fr, MiMC7, PublicKeyCiphertext, PublicKeyEncryption,
    SymmetricCiphertext, SymmetricKeyEncryption, Upk, UserKey,
};
use num_bigint::{BigInt, BigUint};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, WalletError};
use crate::note::{nullifier, Note};
use crate::prover::Proof;
use crate::types::{address_to_fr, Address, TokenKind, TransferAmounts};

/// The token being moved and the ledger slot it lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub ena_index: u64,
    pub token_address: Address,
    pub token_id: Fr,
    pub kind: TokenKind,
}

#[derive(Clone, Debug)]
pub struct ZkWalletKeys {
    pub user_key: UserKey,
    /// Public half only.
    pub audit_key: AuditKey,
    pub receiver_key: Upk,
}

#[derive(Clone, Debug)]
pub struct SnarkInputRequest {
    pub keys: ZkWalletKeys,
    pub token: TokenInfo,
    pub amounts: TransferAmounts,
    /// Current ciphertext of the ledger slot.
    pub sct: SymmetricCiphertext,
    pub root: Fr,
    pub merkle_path: Vec<Fr>,
}

/// Public inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub apk: AffinePoint,
    pub cin: SymmetricCiphertext,
    pub rt: Fr,
    pub sn: Fr,
    pub addr: Fr,
    pub k_b: Fr,
    pub k_u: AffinePoint,
    pub cm_: Fr,
    pub cout: SymmetricCiphertext,
    pub pv: u128,
    pub pv_: u128,
    /// `None` while the token stays hidden (no public leg).
    pub tk_addr_: Option<Address>,
    pub tk_id_: Fr,
    /// `G_r`, the pCT's `c0`.
    pub g_r: AffinePoint,
    /// `K_u`, the pCT's `c1`.
    pub ct_k_u: AffinePoint,
    /// `K_a`, the pCT's `c2`.
    pub ct_k_a: AffinePoint,
    /// `CT`, the pCT's masked message.
    pub ct: Vec<Fr>,
}

impl Statement {
    /// The new note's ciphertext, as the `LogZkTransfer` event will carry it.
    pub fn pct(&self) -> PublicKeyCiphertext {
        PublicKeyCiphertext {
            c0: self.g_r,
            c1: self.ct_k_u,
            c2: self.ct_k_a,
            c3: self.ct.clone(),
        }
    }
}

/// Private inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Witness {
    pub sk: Fr,
    pub cm: Fr,
    pub du: Fr,
    pub dv: u128,
    pub tk_addr: Address,
    pub tk_id: Fr,
    pub addr_r: Fr,
    pub k_b_: Fr,
    pub k_u_: AffinePoint,
    pub du_: Fr,
    pub dv_: u128,
    pub r: Fr,
    pub k: AffinePoint,
    pub k_point_x: Fr,
    pub leaf_pos: u64,
    pub tree_proof: Vec<Fr>,
    pub leaf_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnarkInputParam {
    pub statement: Statement,
    pub witness: Witness,
    pub ena_index: u64,
    pub receiver_eoa: Address,
}

/// Arguments of a `zkTransfer*` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractArgs {
    /// `a ++ b ++ c`.
    pub proof: Vec<BigUint>,
    pub inputs: Vec<Fr>,
    pub receiver_eoa: Address,
    pub ena_index: u64,
}

/// Number of public inputs the contract verifies.
pub const CONTRACT_INPUT_LEN: usize = 23;

/// A zero-value note owned by the sender, spent when the transfer has no real input note.
pub fn null_note(sender_ena: Fr, token_address: &str, token_id: Fr) -> Note {
    Note::new(
        random_field_element(),
        token_address.to_string(),
        token_id,
        0,
        sender_ena,
        0,
    )
}

/// Build statement and witness for one transfer.
pub fn generate_snark_input(
    request: &SnarkInputRequest,
    receiver_eoa: &str,
) -> Result<SnarkInputParam> {
    let keys = &request.keys;
    let token = &request.token;
    let user = &keys.user_key;
    let receiver = &keys.receiver_key;
    let mimc = MiMC7::new();
    let senc = SymmetricKeyEncryption::new(user.sk);
    let token_address = address_to_fr(&token.token_address);

    let note = match &request.amounts.from_note {
        Some(note) => note.clone(),
        None => {
            debug!("no input note, spending a null note");
            null_note(user.ena(), &token.token_address, token.token_id)
        }
    };

    let in_private = note.amount;
    let in_public = request.amounts.from_public_amount;
    let out_private = request.amounts.to_private_amount;
    let out_public = request.amounts.to_public_amount;

    let old_balance = if request.sct.is_empty() {
        Fr::from(0u64)
    } else {
        senc.decrypt(&request.sct)
            .get(2)
            .copied()
            .ok_or_else(|| WalletError::MissingData("ledger slot has no balance".into()))?
    };

    let sn = nullifier(&note.commitment, &user.sk);
    let new_open = random_field_element();

    let pct_msg = [
        new_open,
        token_address,
        token.token_id,
        fr_from_u128(out_private),
        receiver.ena,
    ];
    let pct = PublicKeyEncryption::new().encrypt(&keys.audit_key.pk, receiver, &pct_msg)?;

    let new_balance = BigInt::from(fr_to_biguint(&old_balance))
        + BigInt::from(in_private)
        + BigInt::from(in_public)
        - BigInt::from(out_private)
        - BigInt::from(out_public);
    let new_balance = new_balance
        .to_biguint()
        .ok_or(WalletError::InvalidTransferAmount)?;
    debug!(%new_balance, "recomputed ledger balance");

    let cout = senc.encrypt(&[token_address, token.token_id, fr_from_biguint(&new_balance)?]);
    let cm_ = mimc.hash(&[
        new_open,
        token_address,
        token.token_id,
        fr_from_u128(out_private),
        receiver.ena,
    ]);

    let disclosed = in_public != 0 || out_public != 0;
    let (tk_addr_, tk_id_) = if disclosed {
        (Some(token.token_address.clone()), token.token_id)
    } else {
        (None, Fr::from(0u64))
    };

    let statement = Statement {
        apk: keys.audit_key.pk,
        cin: request.sct.clone(),
        rt: request.root,
        sn,
        addr: user.ena(),
        k_b: user.pk.pk_own,
        k_u: user.pk.pk_enc,
        cm_,
        cout,
        pv: in_public,
        pv_: out_public,
        tk_addr_,
        tk_id_,
        g_r: pct.ciphertext.c0,
        ct_k_u: pct.ciphertext.c1,
        ct_k_a: pct.ciphertext.c2,
        ct: pct.ciphertext.c3.clone(),
    };

    let witness = Witness {
        sk: user.sk,
        cm: note.commitment,
        du: note.open,
        dv: in_private,
        tk_addr: token.token_address.clone(),
        tk_id: token.token_id,
        addr_r: receiver.ena,
        k_b_: receiver.pk_own,
        k_u_: receiver.pk_enc,
        du_: new_open,
        dv_: out_private,
        r: pct.r,
        k: pct.k,
        k_point_x: pct.k.x,
        leaf_pos: note.index,
        tree_proof: request.merkle_path.clone(),
        leaf_index: note.index,
    };

    Ok(SnarkInputParam {
        statement,
        witness,
        ena_index: token.ena_index,
        receiver_eoa: receiver_eoa.to_string(),
    })
}

fn hex(value: &Fr) -> String {
    fr_to_hex(value)
}

fn hex64(value: &Fr) -> String {
    fr_to_padded_hex(value, 64)
}

fn u128_hex64(value: u128) -> String {
    format!("{value:064x}")
}

fn point(p: &AffinePoint) -> Value {
    json!([hex(&p.x), hex(&p.y)])
}

fn sct_list(sct: &SymmetricCiphertext) -> Value {
    Value::from(sct.to_list().iter().map(hex).collect::<Vec<_>>())
}

fn strip_address(address: &str) -> String {
    let digits = address.strip_prefix("0x").unwrap_or(address).to_ascii_lowercase();
    format!("{digits:0>40}")
}

impl SnarkInputParam {
    fn statement_value(&self) -> Value {
        let s = &self.statement;
        json!({
            "apk": point(&s.apk),
            "cin": sct_list(&s.cin),
            "rt": hex(&s.rt),
            "sn": hex(&s.sn),
            "addr": hex(&s.addr),
            "k_b": hex(&s.k_b),
            "k_u": point(&s.k_u),
            "cm_": hex(&s.cm_),
            "cout": sct_list(&s.cout),
            "pv": u128_hex64(s.pv),
            "pv_": u128_hex64(s.pv_),
            "tk_addr_": s.tk_addr_.as_deref().map(strip_address).unwrap_or_else(|| "0".to_string()),
            "tk_id_": hex(&s.tk_id_),
            "G_r": point(&s.g_r),
            "K_u": point(&s.ct_k_u),
            "K_a": point(&s.ct_k_a),
            "CT": s.ct.iter().map(hex).collect::<Vec<_>>(),
        })
    }

    fn witness_value(&self) -> Value {
        let w = &self.witness;
        json!({
            "sk": hex64(&w.sk),
            "cm": hex64(&w.cm),
            "du": hex64(&w.du),
            "dv": u128_hex64(w.dv),
            "tk_addr": strip_address(&w.tk_addr),
            "tk_id": hex(&w.tk_id),
            "addr_r": hex(&w.addr_r),
            "k_b_": hex(&w.k_b_),
            "k_u_": point(&w.k_u_),
            "du_": hex(&w.du_),
            "dv_": u128_hex64(w.dv_),
            "r": hex(&w.r),
            "k": point(&w.k),
            "k_point_x": hex(&w.k_point_x),
            "leaf_pos": format!("{:032x}", w.leaf_pos),
            "tree_proof": w.tree_proof.iter().map(hex).collect::<Vec<_>>(),
            "leaf_index": format!("{:x}", w.leaf_index),
        })
    }

    /// `{"statement": .., "witnesses": ..}` as the prover reads it.
    pub fn to_circuit_args(&self) -> Value {
        json!({
            "statement": self.statement_value(),
            "witnesses": self.witness_value(),
        })
    }

    pub fn circuit_args_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_circuit_args())?)
    }

    /// The statement alone, which is what verification takes.
    pub fn statement_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.statement_value())?)
    }

    pub fn to_contract_args(&self, proof: &Proof) -> Result<ContractArgs> {
        let s = &self.statement;
        let tk_addr = s
            .tk_addr_
            .as_deref()
            .map(address_to_fr)
            .unwrap_or(Fr::from(0u64));

        let mut inputs = Vec::with_capacity(CONTRACT_INPUT_LEN);
        inputs.extend([s.rt, s.sn, s.cm_]);
        inputs.extend(s.cout.to_list());
        inputs.extend([fr_from_u128(s.pv), fr_from_u128(s.pv_), tk_addr, s.tk_id_]);
        inputs.extend(s.pct().to_list());

        Ok(ContractArgs {
            proof: proof.to_uint_list()?,
            inputs,
            receiver_eoa: self.receiver_eoa.clone(),
            ena_index: self.ena_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azeroth_crypto::field::fr_to_u128;

    const NATIVE: &str = "0x0000000000000000000000000000000000000000";

    fn keys() -> ZkWalletKeys {
        ZkWalletKeys {
            user_key: UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap(),
            audit_key: AuditKey::public_only(AuditKey::recover(Fr::from(11u64)).unwrap().pk),
            receiver_key: UserKey::recover_from_user_sk(Fr::from(8u64)).unwrap().pk,
        }
    }

    fn request(amounts: TransferAmounts, sct: SymmetricCiphertext) -> SnarkInputRequest {
        SnarkInputRequest {
            keys: keys(),
            token: TokenInfo {
                ena_index: 0,
                token_address: NATIVE.into(),
                token_id: Fr::from(0u64),
                kind: TokenKind::Native,
            },
            amounts,
            sct,
            root: Fr::from(99u64),
            merkle_path: vec![Fr::from(1u64), Fr::from(2u64)],
        }
    }

    fn new_balance(param: &SnarkInputParam) -> u128 {
        let plain = SymmetricKeyEncryption::new(Fr::from(7u64)).decrypt(&param.statement.cout);
        fr_to_u128(&plain[2]).unwrap()
    }

    #[test]
    fn test_null_note_with_public_deposit() {
        let amounts = TransferAmounts {
            from_public_amount: 50,
            ..Default::default()
        };
        let param = generate_snark_input(&request(amounts, SymmetricCiphertext::empty()), NATIVE)
            .unwrap();
        let user = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();

        assert_eq!(new_balance(&param), 50);
        assert_eq!(param.witness.dv, 0);
        assert_eq!(param.witness.leaf_pos, 0);
        // the synthesized note is bound to the sender's own ena
        let null = Note {
            open: param.witness.du,
            token_address: NATIVE.into(),
            token_id: Fr::from(0u64),
            amount: 0,
            addr: user.ena(),
            commitment: param.witness.cm,
            index: 0,
            is_spent: false,
        };
        assert!(null.is_valid());
        assert_eq!(param.statement.sn, nullifier(&param.witness.cm, &user.sk));
    }

    #[test]
    fn test_negative_balance_rejected() {
        let amounts = TransferAmounts {
            to_private_amount: 50,
            ..Default::default()
        };
        let err = generate_snark_input(&request(amounts, SymmetricCiphertext::empty()), NATIVE)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidTransferAmount));
    }

    #[test]
    fn test_spend_from_ledger_and_note() {
        let user = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let sct = SymmetricKeyEncryption::new(user.sk).encrypt(&[
            Fr::from(0u64),
            Fr::from(0u64),
            Fr::from(150u64),
        ]);
        let note = Note::new(Fr::from(9u64), NATIVE.into(), Fr::from(0u64), 100, user.ena(), 2);
        let amounts = TransferAmounts {
            from_note: Some(note.clone()),
            to_private_amount: 120,
            to_public_amount: 30,
            ..Default::default()
        };
        let param = generate_snark_input(&request(amounts, sct.clone()), "0xdead").unwrap();

        assert_eq!(new_balance(&param), 100);
        assert_eq!(param.statement.cin, sct);
        assert_eq!(param.witness.cm, note.commitment);
        assert_eq!(param.witness.leaf_pos, 2);
        assert_eq!(param.witness.leaf_index, 2);
        assert_eq!(param.statement.tk_addr_.as_deref(), Some(NATIVE));

        // the receiver can claim the new note
        let receiver_sk = Fr::from(8u64);
        let owned = crate::note::NoteOwnership::new(receiver_sk)
            .is_owner(&param.statement.pct().to_list(), &param.statement.cm_)
            .unwrap();
        assert_eq!(owned.amount, 120);
    }

    #[test]
    fn test_token_hidden_without_public_leg() {
        let user = UserKey::recover_from_user_sk(Fr::from(7u64)).unwrap();
        let note = Note::new(Fr::from(9u64), NATIVE.into(), Fr::from(0u64), 100, user.ena(), 0);
        let amounts = TransferAmounts {
            from_note: Some(note),
            to_private_amount: 100,
            ..Default::default()
        };
        let param = generate_snark_input(&request(amounts, SymmetricCiphertext::empty()), NATIVE)
            .unwrap();
        assert_eq!(param.statement.tk_addr_, None);

        let args = param.to_circuit_args();
        assert_eq!(args["statement"]["tk_addr_"], "0");
        assert_eq!(args["statement"]["tk_id_"], "0");
        assert_eq!(args["witnesses"]["tk_addr"], "0".repeat(40));
    }

    #[test]
    fn test_circuit_args_layout() {
        let amounts = TransferAmounts {
            from_public_amount: 255,
            ..Default::default()
        };
        let param = generate_snark_input(&request(amounts, SymmetricCiphertext::empty()), NATIVE)
            .unwrap();
        let args = param.to_circuit_args();
        let statement = &args["statement"];
        let witnesses = &args["witnesses"];

        assert_eq!(statement["pv"], format!("{}ff", "0".repeat(62)));
        assert_eq!(statement["rt"], "63");
        assert_eq!(statement["cin"], json!(["0", "0", "0", "0"]));
        assert_eq!(statement["apk"].as_array().unwrap().len(), 2);
        assert_eq!(statement["CT"].as_array().unwrap().len(), 5);
        assert_eq!(statement["tk_addr_"], "0".repeat(40));
        assert_eq!(witnesses["sk"], format!("{}7", "0".repeat(63)));
        assert_eq!(witnesses["leaf_pos"], "0".repeat(32));
        assert_eq!(witnesses["tree_proof"], json!(["1", "2"]));
        assert_eq!(witnesses["leaf_index"], "0");

        let statement_only: Value = serde_json::from_str(&param.statement_json().unwrap()).unwrap();
        assert_eq!(&statement_only, statement);
    }

    #[test]
    fn test_contract_args_order() {
        let amounts = TransferAmounts {
            from_public_amount: 5,
            to_public_amount: 0,
            ..Default::default()
        };
        let param = generate_snark_input(&request(amounts, SymmetricCiphertext::empty()), NATIVE)
            .unwrap();
        let proof = Proof {
            a: vec!["0x1".into(), "0x2".into()],
            b: vec!["0x3".into(), "0x4".into(), "0x5".into(), "0x6".into()],
            c: vec!["0x7".into(), "0x8".into()],
        };
        let args = param.to_contract_args(&proof).unwrap();

        assert_eq!(args.proof.len(), 8);
        assert_eq!(args.inputs.len(), CONTRACT_INPUT_LEN);
        assert_eq!(args.inputs[0], Fr::from(99u64));
        assert_eq!(args.inputs[1], param.statement.sn);
        assert_eq!(args.inputs[3..7], param.statement.cout.to_list()[..]);
        assert_eq!(args.inputs[7], Fr::from(5u64));
        assert_eq!(args.inputs[11], param.statement.g_r.x);
        assert_eq!(args.inputs[18..], param.statement.ct[..]);
        assert_eq!(args.ena_index, 0);
    }
}
