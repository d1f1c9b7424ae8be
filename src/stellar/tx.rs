//! Deterministic encoding of the bridge's payment transactions.
//!
//! The master and every cosigner rebuild the identical transaction from the
//! signing request fields and sign the same network signature base, so the
//! encoding here must be byte-stable. Only the subset of the transaction
//! format the bridge emits is covered: an ed25519 source, sequential
//! payments of one asset, and a hash or return memo.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use eyre::{eyre, Result};
use sha2::{Digest, Sha256};

/// Network base fee per operation, in stroops.
pub const BASE_FEE: u32 = 100;

const KEY_TYPE_ED25519: u32 = 0;
const MEMO_HASH: u32 = 3;
const MEMO_RETURN: u32 = 4;
const PRECOND_NONE: u32 = 0;
const OP_PAYMENT: u32 = 1;
const ASSET_TYPE_ALPHANUM4: u32 = 1;
const ENVELOPE_TYPE_TX: u32 = 2;

/// Idempotency memo attached to every bridge payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memo {
    /// Low 32 bytes of the EVM withdrawal transaction hash.
    Hash([u8; 32]),
    /// Hash of the Stellar deposit being refunded.
    Return([u8; 32]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOperation {
    pub destination: String,
    pub amount_stroops: i64,
}

/// A payment transaction in the bridged asset, ready to encode and sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub source: String,
    /// The sequence number the transaction consumes (account sequence + 1).
    pub sequence: i64,
    pub memo: Memo,
    pub operations: Vec<PaymentOperation>,
    pub asset_code: String,
    pub asset_issuer: String,
}

/// A signature with the standard 4-byte public-key hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoratedSignature {
    pub hint: [u8; 4],
    pub signature: Vec<u8>,
}

impl PaymentTransaction {
    pub fn fee(&self) -> u32 {
        BASE_FEE * self.operations.len() as u32
    }

    /// Binary transaction body (the part covered by signatures).
    pub fn to_xdr(&self) -> Result<Vec<u8>> {
        if self.operations.is_empty() || self.operations.len() > 100 {
            return Err(eyre!(
                "payment transaction must carry 1..=100 operations, got {}",
                self.operations.len()
            ));
        }
        let mut out = Vec::with_capacity(256);
        write_account(&mut out, &self.source)?;
        write_u32(&mut out, self.fee());
        write_i64(&mut out, self.sequence);
        write_u32(&mut out, PRECOND_NONE);
        match self.memo {
            Memo::Hash(h) => {
                write_u32(&mut out, MEMO_HASH);
                out.extend_from_slice(&h);
            }
            Memo::Return(h) => {
                write_u32(&mut out, MEMO_RETURN);
                out.extend_from_slice(&h);
            }
        }
        write_u32(&mut out, self.operations.len() as u32);
        for op in &self.operations {
            // no per-operation source account
            write_u32(&mut out, 0);
            write_u32(&mut out, OP_PAYMENT);
            write_account(&mut out, &op.destination)?;
            write_asset(&mut out, &self.asset_code, &self.asset_issuer)?;
            write_i64(&mut out, op.amount_stroops);
        }
        // ext
        write_u32(&mut out, 0);
        Ok(out)
    }

    /// The 32-byte digest every signer signs:
    /// `sha256(network_id || ENVELOPE_TYPE_TX || transaction)`.
    pub fn signature_base(&self, network_passphrase: &str) -> Result<[u8; 32]> {
        let network_id: [u8; 32] = Sha256::digest(network_passphrase.as_bytes()).into();
        let mut payload = Vec::with_capacity(300);
        payload.extend_from_slice(&network_id);
        write_u32(&mut payload, ENVELOPE_TYPE_TX);
        payload.extend_from_slice(&self.to_xdr()?);
        Ok(Sha256::digest(&payload).into())
    }

    /// Sign the transaction with an ed25519 key, producing a decorated
    /// signature with the signer's public-key hint.
    pub fn sign(
        &self,
        network_passphrase: &str,
        signing_key: &SigningKey,
    ) -> Result<DecoratedSignature> {
        let digest = self.signature_base(network_passphrase)?;
        let signature = signing_key.sign(&digest).to_bytes().to_vec();
        let public = signing_key.verifying_key().to_bytes();
        let mut hint = [0u8; 4];
        hint.copy_from_slice(&public[28..]);
        Ok(DecoratedSignature { hint, signature })
    }

    /// Assemble the base64 envelope Horizon accepts.
    pub fn envelope_xdr(&self, signatures: &[DecoratedSignature]) -> Result<String> {
        if signatures.is_empty() || signatures.len() > 20 {
            return Err(eyre!(
                "envelope must carry 1..=20 signatures, got {}",
                signatures.len()
            ));
        }
        let mut out = Vec::with_capacity(512);
        write_u32(&mut out, ENVELOPE_TYPE_TX);
        out.extend_from_slice(&self.to_xdr()?);
        write_u32(&mut out, signatures.len() as u32);
        for sig in signatures {
            out.extend_from_slice(&sig.hint);
            write_opaque(&mut out, &sig.signature);
        }
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }
}

/// Decode a `G...` address and verify a raw ed25519 signature over the
/// transaction digest. Used when validating cosigner responses.
pub fn verify_signature(address: &str, digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(public) = stellar_strkey::ed25519::PublicKey::from_string(address) else {
        return false;
    };
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&public.0) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(digest, &sig).is_ok()
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_opaque(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
    // pad to a 4-byte boundary
    for _ in 0..(4 - bytes.len() % 4) % 4 {
        out.push(0);
    }
}

fn write_account(out: &mut Vec<u8>, address: &str) -> Result<()> {
    let public = stellar_strkey::ed25519::PublicKey::from_string(address)
        .map_err(|e| eyre!("invalid stellar address {}: {:?}", address, e))?;
    write_u32(out, KEY_TYPE_ED25519);
    out.extend_from_slice(&public.0);
    Ok(())
}

fn write_asset(out: &mut Vec<u8>, code: &str, issuer: &str) -> Result<()> {
    if code.is_empty() || code.len() > 4 {
        return Err(eyre!("asset code {} does not fit alphanum4", code));
    }
    write_u32(out, ASSET_TYPE_ALPHANUM4);
    let mut padded = [0u8; 4];
    padded[..code.len()].copy_from_slice(code.as_bytes());
    out.extend_from_slice(&padded);
    write_account(out, issuer)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Friendbot-style throwaway identities, valid strkey encodings.
    const SOURCE: &str = "GDQP2KPQGKIHYJGXNUIYOMHARUARCA7DJT5FO2FFOOKY3B2WSQHG4W37";
    const DEST: &str = "GAS4V4O2B7DW5T7IQRPEEVCRXMDZESKISR7DVIGKZQYYV3OSQ5SH5LVP";
    const ISSUER: &str = "GA7QYNF7SOWQ3GLR2BGMZEHXAVIRZA4KVWLTJJFC7MGXUA74P7UJVSGZ";

    fn tx(ops: Vec<PaymentOperation>, memo: Memo) -> PaymentTransaction {
        PaymentTransaction {
            source: SOURCE.into(),
            sequence: 103420918407103889,
            memo,
            operations: ops,
            asset_code: "TFT".into(),
            asset_issuer: ISSUER.into(),
        }
    }

    fn one_op() -> Vec<PaymentOperation> {
        vec![PaymentOperation {
            destination: DEST.into(),
            amount_stroops: 990_000_000,
        }]
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = tx(one_op(), Memo::Hash([9; 32])).to_xdr().unwrap();
        let b = tx(one_op(), Memo::Hash([9; 32])).to_xdr().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fee_scales_with_operations() {
        let mut ops = one_op();
        assert_eq!(tx(ops.clone(), Memo::Hash([0; 32])).fee(), 100);
        ops.push(PaymentOperation {
            destination: DEST.into(),
            amount_stroops: 10_000_000,
        });
        assert_eq!(tx(ops, Memo::Hash([0; 32])).fee(), 200);
    }

    #[test]
    fn test_memo_kind_changes_the_digest() {
        let passphrase = "Test SDF Network ; September 2015";
        let hash = tx(one_op(), Memo::Hash([1; 32]))
            .signature_base(passphrase)
            .unwrap();
        let ret = tx(one_op(), Memo::Return([1; 32]))
            .signature_base(passphrase)
            .unwrap();
        assert_ne!(hash, ret);
    }

    #[test]
    fn test_digest_depends_on_network() {
        let t = tx(one_op(), Memo::Hash([1; 32]));
        let a = t.signature_base("Test SDF Network ; September 2015").unwrap();
        let b = t
            .signature_base("Public Global Stellar Network ; September 2015")
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        let public = stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes());
        let address = public.to_string();

        let t = tx(one_op(), Memo::Hash([1; 32]));
        let passphrase = "Test SDF Network ; September 2015";
        let sig = t.sign(passphrase, &signing_key).unwrap();
        let digest = t.signature_base(passphrase).unwrap();

        assert_eq!(sig.signature.len(), 64);
        assert_eq!(&sig.hint[..], &signing_key.verifying_key().to_bytes()[28..]);
        assert!(verify_signature(&address, &digest, &sig.signature));
        assert!(!verify_signature(&address, &[0u8; 32], &sig.signature));
    }

    #[test]
    fn test_envelope_is_valid_base64_and_carries_signatures() {
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        let t = tx(one_op(), Memo::Hash([1; 32]));
        let sig = t.sign("Test SDF Network ; September 2015", &signing_key).unwrap();
        let envelope = t.envelope_xdr(&[sig]).unwrap();

        let raw = base64::engine::general_purpose::STANDARD
            .decode(envelope)
            .unwrap();
        // envelope discriminant, then the transaction body, then one signature
        assert_eq!(&raw[..4], &2u32.to_be_bytes());
        let body = t.to_xdr().unwrap();
        assert_eq!(&raw[4..4 + body.len()], &body[..]);
    }

    #[test]
    fn test_unsigned_envelope_is_rejected() {
        let t = tx(one_op(), Memo::Hash([1; 32]));
        assert!(t.envelope_xdr(&[]).is_err());
    }

    #[test]
    fn test_operation_bounds() {
        assert!(tx(vec![], Memo::Hash([0; 32])).to_xdr().is_err());
    }
}
