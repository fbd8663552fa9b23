// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Wallet identity resolver.
//!
//! Computes a stable, privacy-preserving checksum from a wallet's public key.
//! The checksum is what the approval window shows so a user can confirm they
//! are granting access to the wallet they expect: a 64-char hex seed driving
//! an identicon, plus a short `LLLL-DDDD` code that can be read out loud.
//!
//! Legacy sequential wallets and modern wallets use different, deliberately
//! non-interchangeable digests. The caller always states the [`WalletKind`];
//! mixing kinds for the same key yields a checksum that will not match any
//! previously-displayed one.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::WalletKind;

/// Domain-separation key for the modern checksum digest.
const MODERN_CHECKSUM_KEY: &[u8] = b"wallet-checksum/v2";

/// Alphabet for the textual checksum. Sixteen consonants, indexed by digest
/// nibbles; no vowels, so the output never spells words.
const CHECKSUM_ALPHABET: [char; 16] = [
    'B', 'C', 'D', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'R', 'S', 'T', 'Z',
];

/// Deterministic human/visually verifiable wallet fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletChecksum {
    /// Lowercase hex seed (64 chars) for the identicon renderer.
    pub image: String,
    /// Short human-describable code, `LLLL-DDDD`.
    pub text: String,
}

/// Compute the checksum for a wallet's public key.
///
/// Pure function of its inputs: no I/O, deterministic, and the two kinds are
/// domain-separated so they can never collide for the same key.
pub fn checksum_for(public_key: &[u8], kind: WalletKind) -> WalletChecksum {
    let digest: [u8; 32] = match kind {
        WalletKind::Legacy => {
            // Double SHA-256, matching the original sequential-wallet scheme.
            let first = Sha256::digest(public_key);
            Sha256::digest(first).into()
        }
        WalletKind::Modern => {
            let mut mac = Hmac::<Sha256>::new_from_slice(MODERN_CHECKSUM_KEY)
                .expect("hmac accepts keys of any length");
            mac.update(public_key);
            mac.finalize().into_bytes().into()
        }
    };

    render(&digest)
}

/// Render a digest into the shared checksum format.
fn render(digest: &[u8; 32]) -> WalletChecksum {
    let image: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    let letters: String = digest[..2]
        .iter()
        .copied()
        .flat_map(|b| [b >> 4, b & 0x0f])
        .map(|nibble| CHECKSUM_ALPHABET[nibble as usize])
        .collect();

    let number = u16::from_be_bytes([digest[2], digest[3]]) % 10_000;

    WalletChecksum {
        image,
        text: format!("{letters}-{number:04}"),
    }
}
