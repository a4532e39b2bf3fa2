//! azeroth-wallet
//!
//! Wallet core for Azeroth shielded transfers on an EVM chain.
//!
//! Layout:
//! - [`note`]: the note model and receive-side ownership detection
//! - [`ena_status`]: the per-account encrypted balance ledger (ENA slots), with a single-flight scan
//! - [`snark_input`]: assembly of the transfer circuit's statement and witness
//! - [`transfer`]: orchestration of a transfer against the chain and the proving service
//! - [`sync`]: the forward and backward note-sync engines and their progress channel
//!
//! Everything that talks to the outside world goes through a trait in [`chain`], [`prover`] or
//! [`store`]; the crate carries an in-memory store and nothing else concrete.

pub mod chain;
pub mod config;
pub mod ena_status;
pub mod error;
pub mod note;
pub mod prover;
pub mod snark_input;
pub mod store;
pub mod sync;
pub mod tokens;
pub mod transfer;
pub mod types;

pub use chain::{AzerothChain, ChainConnector, ContractEntry};
pub use config::WalletConfig;
pub use ena_status::{EnaSlot, EnaState, EnaStatus, EnaStatusRegistry, GetAllEnaStatusResult};
pub use error::{Result, TransferFailure, TransferFailureKind, WalletError};
pub use note::{Note, NoteOwnership, OwnedNote, StoredNote};
pub use prover::{Proof, ProvingService};
pub use snark_input::{ContractArgs, SnarkInputParam, SnarkInputRequest};
pub use store::{LocalStore, MemoryStore, ZkEventFilter};
pub use sync::{
    AppProfile, BackwardNoteSync, ForwardNoteSync, NoteProgressNotification, SecretsProvider,
    SyncContext, UpdateSyncManager, BACKWARD_SYNC_LISTENER_KEY, FORWARD_SYNC_LISTENER_KEY,
};
pub use transfer::{TransferContext, TransferReceipt, TransferRequest};
pub use types::*;
