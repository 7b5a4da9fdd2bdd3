//! The CRYPTO PROVIDER capability surface (spec §1 "narrow capability
//! surface... allocate-operation, set-operation-key, cipher-init/update/
//! final, AE-init/update/final, MAC-init/update/compare/final, transient-key
//! allocation and population, and a secure random source").
//!
//! The provider is out of scope for the core per spec §1 ("the raw CRYPTO
//! PROVIDER API" is an external collaborator); what lives here is the
//! narrow trait the core actually calls through, plus one concrete
//! implementation (`RustCryptoProvider`) backing it with real AES/HMAC
//! primitives, and a deterministic `FakeProvider` for tests (spec §9 design
//! note "Provider abstraction... tests substitute a deterministic fake").

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit as GcmKeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ccm::aead::generic_array::typenum;
use ccm::{
    consts::{U12, U16},
    Ccm,
};
use cmac::Cmac;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use zeroize::Zeroize;

use crate::attrs::KeyType;
use crate::error::ProviderError;

// ---------------------------------------------------------------------------
// Transient key object
// ---------------------------------------------------------------------------

/// A provider-side transient key object (spec §3 "an optional provider-side
/// transient-key handle, lazily populated at first use"). Holds the raw key
/// bytes; zeroized on drop per spec §5 "Memory hygiene".
pub struct TransientKey {
    pub key_type: KeyType,
    value: Vec<u8>,
}

impl Drop for TransientKey {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl TransientKey {
    pub fn bits(&self) -> u32 {
        (self.value.len() * 8) as u32
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

// ---------------------------------------------------------------------------
// Algorithm / mode selectors
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherAlgorithm {
    EcbNoPad,
    CbcNoPad,
    Cts,
    Ctr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AeAlgorithm {
    Ccm,
    Gcm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacAlgorithm {
    CmacAes,
    XcbcMacAes,
    HmacMd5,
    HmacSha1,
    HmacSha224,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

/// A mechanism as named on the wire (spec §4.E mechanism table). Carries
/// both the key-gen mechanisms and the processing mechanisms in one enum
/// since the Policy Gate checks both against the same allowed-key-type
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    AesKeyGen,
    GenericSecretKeyGen,
    AesEcb,
    AesCbc,
    AesCbcPad,
    AesCts,
    AesCtr,
    AesCcm,
    AesGcm,
    AesCmac,
    AesCmacGeneral,
    AesXcbcMac,
    Md5Hmac,
    Sha1Hmac,
    Sha224Hmac,
    Sha256Hmac,
    Sha384Hmac,
    Sha512Hmac,
}

/// Which provider algorithm family a mechanism drives (spec §4.E table:
/// mechanism -> provider algorithm + mode).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderOp {
    Cipher(CipherAlgorithm),
    Ae(AeAlgorithm),
    Mac(MacAlgorithm),
}

impl Mechanism {
    /// Key types this mechanism may operate a processing step or key-gen
    /// against (spec §4.D rule 2/4, "creation vs. mechanism" and "parent vs.
    /// mechanism").
    pub fn allowed_key_types(self) -> &'static [KeyType] {
        match self {
            Self::AesKeyGen => &[KeyType::Aes],
            Self::GenericSecretKeyGen => &[KeyType::GenericSecret],
            Self::AesEcb
            | Self::AesCbc
            | Self::AesCbcPad
            | Self::AesCts
            | Self::AesCtr
            | Self::AesCcm
            | Self::AesGcm
            | Self::AesCmac
            | Self::AesCmacGeneral
            | Self::AesXcbcMac => &[KeyType::Aes],
            Self::Md5Hmac => &[KeyType::GenericSecret, KeyType::Md5Hmac],
            Self::Sha1Hmac => &[KeyType::GenericSecret, KeyType::Sha1Hmac],
            Self::Sha224Hmac => &[KeyType::GenericSecret, KeyType::Sha224Hmac],
            Self::Sha256Hmac => &[KeyType::GenericSecret, KeyType::Sha256Hmac],
            Self::Sha384Hmac => &[KeyType::GenericSecret, KeyType::Sha384Hmac],
            Self::Sha512Hmac => &[KeyType::GenericSecret, KeyType::Sha512Hmac],
        }
    }

    /// The provider algorithm/mode this mechanism drives. Key-gen mechanisms
    /// have no processing-time counterpart.
    pub fn provider_op(self) -> Result<ProviderOp, crate::error::CoreError> {
        use crate::error::CoreError;
        match self {
            Self::AesEcb => Ok(ProviderOp::Cipher(CipherAlgorithm::EcbNoPad)),
            Self::AesCbc | Self::AesCbcPad => Ok(ProviderOp::Cipher(CipherAlgorithm::CbcNoPad)),
            Self::AesCts => Ok(ProviderOp::Cipher(CipherAlgorithm::Cts)),
            Self::AesCtr => Ok(ProviderOp::Cipher(CipherAlgorithm::Ctr)),
            Self::AesCcm => Ok(ProviderOp::Ae(AeAlgorithm::Ccm)),
            Self::AesGcm => Ok(ProviderOp::Ae(AeAlgorithm::Gcm)),
            Self::AesCmac | Self::AesCmacGeneral => Ok(ProviderOp::Mac(MacAlgorithm::CmacAes)),
            Self::AesXcbcMac => Ok(ProviderOp::Mac(MacAlgorithm::XcbcMacAes)),
            Self::Md5Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacMd5)),
            Self::Sha1Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacSha1)),
            Self::Sha224Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacSha224)),
            Self::Sha256Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacSha256)),
            Self::Sha384Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacSha384)),
            Self::Sha512Hmac => Ok(ProviderOp::Mac(MacAlgorithm::HmacSha512)),
            Self::AesKeyGen | Self::GenericSecretKeyGen => Err(CoreError::MechanismInvalid),
        }
    }
}

/// Parameters for a non-AE cipher init (spec §4.E "ECB requires no
/// parameter... CBC/CBC_PAD/CTS require exactly 16 bytes of IV").
pub struct CipherParams {
    pub iv: Option<[u8; 16]>,
}

/// Parameters for an AE (CCM/GCM) init.
pub struct AeParams {
    pub nonce: Vec<u8>,
    pub tag_len: usize,
    pub aad: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Operation traits
// ---------------------------------------------------------------------------

/// Non-AE cipher operation (ECB/CBC/CTS/CTR).
pub trait CipherOperation: Send {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError>;
    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Exact byte length `finish(final_input)` will produce, computable
    /// without consuming the operation (spec §8 scenario 3: the engine must
    /// report SHORT_BUFFER *before* running `finish`, since `finish` takes
    /// the operation by value and can't be retried).
    fn output_len(&self, final_input_len: usize) -> usize;
}

/// AE encrypt operation (CCM/GCM). Per spec §4.E "CCM/GCM during encrypt:
/// delegate directly to provider AE-update" in principle; here `update`
/// accumulates into scratch and the real one-shot AEAD transform runs in
/// `finish`, which is a faithful rendition since the provider may buffer
/// arbitrarily and the core only needs to honor whatever size it reports
/// (spec §8 scenario 3 has the entire 22-byte ciphertext+tag appear only at
/// `final`).
pub trait AeEncryptOperation: Send {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError>;
    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError>;
    fn output_len(&self, final_input_len: usize) -> usize;
}

/// AE decrypt operation. `update` never reveals plaintext (spec §4.E, P6);
/// `finish` verifies the tag and, only on success, returns the accumulated
/// plaintext.
pub trait AeDecryptOperation: Send {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError>;
    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError>;
    fn output_len(&self, final_input_len: usize) -> usize;
}

/// MAC operation (sign or verify side share the same init/update).
pub trait MacOperation: Send {
    fn update(&mut self, input: &[u8]);
    fn compute_final(self: Box<Self>) -> Vec<u8>;
    fn compare_final(self: Box<Self>, expected: &[u8]) -> Result<(), ProviderError>;
}

/// The narrow capability surface consumed from the CRYPTO PROVIDER.
pub trait CryptoProvider: Send + Sync {
    fn allocate_transient_key(&self, key_type: KeyType) -> Result<TransientKey, ProviderError>;
    fn populate_transient_key(&self, key: &mut TransientKey, value: &[u8]) -> Result<(), ProviderError>;
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, ProviderError>;

    fn cipher_init(
        &self,
        alg: CipherAlgorithm,
        mode: CipherMode,
        key: &TransientKey,
        params: &CipherParams,
    ) -> Result<Box<dyn CipherOperation>, ProviderError>;

    fn ae_encrypt_init(
        &self,
        alg: AeAlgorithm,
        key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeEncryptOperation>, ProviderError>;

    fn ae_decrypt_init(
        &self,
        alg: AeAlgorithm,
        key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeDecryptOperation>, ProviderError>;

    fn mac_init(&self, alg: MacAlgorithm, key: &TransientKey) -> Result<Box<dyn MacOperation>, ProviderError>;
}

// ---------------------------------------------------------------------------
// RustCryptoProvider
// ---------------------------------------------------------------------------

/// The real implementation, backed by RustCrypto's AES block primitives and
/// stream/AEAD/MAC constructions.
#[derive(Default)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn allocate_transient_key(&self, key_type: KeyType) -> Result<TransientKey, ProviderError> {
        Ok(TransientKey { key_type, value: Vec::new() })
    }

    fn populate_transient_key(&self, key: &mut TransientKey, value: &[u8]) -> Result<(), ProviderError> {
        key.value.zeroize();
        key.value = value.to_vec();
        Ok(())
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, ProviderError> {
        let mut buf = vec![0u8; len];
        getrandom::getrandom(&mut buf).map_err(|_| ProviderError::RandomUnavailable)?;
        Ok(buf)
    }

    fn cipher_init(
        &self,
        alg: CipherAlgorithm,
        mode: CipherMode,
        key: &TransientKey,
        params: &CipherParams,
    ) -> Result<Box<dyn CipherOperation>, ProviderError> {
        let key_bytes = key.value().to_vec();
        match alg {
            CipherAlgorithm::EcbNoPad => Ok(Box::new(EcbOperation { key: key_bytes, mode, scratch: Vec::new() })),
            CipherAlgorithm::CbcNoPad => {
                let iv = params.iv.ok_or(ProviderError::OperationFailed("missing IV".into()))?;
                Ok(Box::new(CbcOperation { key: key_bytes, iv, mode, scratch: Vec::new() }))
            }
            CipherAlgorithm::Cts => {
                let iv = params.iv.ok_or(ProviderError::OperationFailed("missing IV".into()))?;
                Ok(Box::new(CtsOperation { key: key_bytes, iv, mode, scratch: Vec::new() }))
            }
            CipherAlgorithm::Ctr => {
                let iv = params.iv.ok_or(ProviderError::OperationFailed("missing IV".into()))?;
                make_ctr_operation(&key_bytes, &iv)
            }
        }
    }

    fn ae_encrypt_init(
        &self,
        alg: AeAlgorithm,
        key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeEncryptOperation>, ProviderError> {
        Ok(Box::new(AeEncryptScratch {
            alg,
            key: key.value().to_vec(),
            nonce: params.nonce.clone(),
            tag_len: params.tag_len,
            aad: params.aad.clone(),
            scratch: Vec::new(),
        }))
    }

    fn ae_decrypt_init(
        &self,
        alg: AeAlgorithm,
        key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeDecryptOperation>, ProviderError> {
        Ok(Box::new(AeDecryptScratch {
            alg,
            key: key.value().to_vec(),
            nonce: params.nonce.clone(),
            tag_len: params.tag_len,
            aad: params.aad.clone(),
            scratch: Vec::new(),
        }))
    }

    fn mac_init(&self, alg: MacAlgorithm, key: &TransientKey) -> Result<Box<dyn MacOperation>, ProviderError> {
        let key_bytes = key.value().to_vec();
        match alg {
            MacAlgorithm::CmacAes => Ok(Box::new(CmacOperation::new(&key_bytes)?)),
            MacAlgorithm::XcbcMacAes => Ok(Box::new(CmacOperation::new(&key_bytes)?)),
            MacAlgorithm::HmacMd5 => Ok(Box::new(HmacOperation::<Md5>::new(&key_bytes))),
            MacAlgorithm::HmacSha1 => Ok(Box::new(HmacOperation::<Sha1>::new(&key_bytes))),
            MacAlgorithm::HmacSha224 => Ok(Box::new(HmacOperation::<Sha224>::new(&key_bytes))),
            MacAlgorithm::HmacSha256 => Ok(Box::new(HmacOperation::<Sha256>::new(&key_bytes))),
            MacAlgorithm::HmacSha384 => Ok(Box::new(HmacOperation::<Sha384>::new(&key_bytes))),
            MacAlgorithm::HmacSha512 => Ok(Box::new(HmacOperation::<Sha512>::new(&key_bytes))),
        }
    }
}

// ---------------------------------------------------------------------------
// Block dispatch helpers (AES-128/192/256 share every mode below)
// ---------------------------------------------------------------------------

enum AesBlock {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl AesBlock {
    fn new(key: &[u8]) -> Result<Self, ProviderError> {
        match key.len() {
            16 => Ok(Self::Aes128(Box::new(Aes128::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?))),
            24 => Ok(Self::Aes192(Box::new(Aes192::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?))),
            32 => Ok(Self::Aes256(Box::new(Aes256::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?))),
            _ => Err(ProviderError::KeyPopulationFailed),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(ga),
            Self::Aes192(c) => c.encrypt_block(ga),
            Self::Aes256(c) => c.encrypt_block(ga),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(ga),
            Self::Aes192(c) => c.decrypt_block(ga),
            Self::Aes256(c) => c.decrypt_block(ga),
        }
    }
}

fn xor16(a: &mut [u8; 16], b: &[u8; 16]) {
    for i in 0..16 {
        a[i] ^= b[i];
    }
}

// ---------------------------------------------------------------------------
// ECB (no padding)
// ---------------------------------------------------------------------------

struct EcbOperation {
    key: Vec<u8>,
    mode: CipherMode,
    scratch: Vec<u8>,
}

impl CipherOperation for EcbOperation {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.scratch.extend_from_slice(input);
        let whole_blocks = self.scratch.len() / 16;
        let take = whole_blocks * 16;
        let chunk = self.scratch.drain(..take).collect::<Vec<_>>();
        process_ecb_blocks(&self.key, self.mode, &chunk)
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut all = self.scratch;
        all.extend_from_slice(input);
        if all.len() % 16 != 0 {
            return Err(ProviderError::OperationFailed("ECB NOPAD requires block-aligned input".into()));
        }
        process_ecb_blocks(&self.key, self.mode, &all)
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        self.scratch.len() + final_input_len
    }
}

fn process_ecb_blocks(key: &[u8], mode: CipherMode, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let cipher = AesBlock::new(key)?;
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        match mode {
            CipherMode::Encrypt => cipher.encrypt_block(&mut block),
            CipherMode::Decrypt => cipher.decrypt_block(&mut block),
        }
        out.extend_from_slice(&block);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// CBC (no padding)
// ---------------------------------------------------------------------------

struct CbcOperation {
    key: Vec<u8>,
    iv: [u8; 16],
    mode: CipherMode,
    scratch: Vec<u8>,
}

impl CipherOperation for CbcOperation {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.scratch.extend_from_slice(input);
        let whole_blocks = self.scratch.len() / 16;
        let take = whole_blocks * 16;
        let chunk = self.scratch.drain(..take).collect::<Vec<_>>();
        self.process(&chunk)
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut me = *self;
        let mut all = std::mem::take(&mut me.scratch);
        all.extend_from_slice(input);
        if all.len() % 16 != 0 {
            return Err(ProviderError::OperationFailed("CBC NOPAD requires block-aligned input".into()));
        }
        me.process(&all)
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        self.scratch.len() + final_input_len
    }
}

impl CbcOperation {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let cipher = AesBlock::new(&self.key)?;
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(16) {
            let mut block = [0u8; 16];
            block.copy_from_slice(chunk);
            match self.mode {
                CipherMode::Encrypt => {
                    xor16(&mut block, &self.iv);
                    cipher.encrypt_block(&mut block);
                    self.iv = block;
                }
                CipherMode::Decrypt => {
                    let ct = block;
                    cipher.decrypt_block(&mut block);
                    xor16(&mut block, &self.iv);
                    self.iv = ct;
                }
            }
            out.extend_from_slice(&block);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// CTS (ciphertext stealing, CBC-CS3) — buffered until finish, see
// `AeEncryptOperation` doc comment for why buffering here is faithful.
// ---------------------------------------------------------------------------

struct CtsOperation {
    key: Vec<u8>,
    iv: [u8; 16],
    mode: CipherMode,
    scratch: Vec<u8>,
}

impl CipherOperation for CtsOperation {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.scratch.extend_from_slice(input);
        Ok(Vec::new())
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut data = self.scratch;
        data.extend_from_slice(input);
        if data.len() < 17 {
            return Err(ProviderError::OperationFailed("CTS requires more than one block".into()));
        }
        let cipher = AesBlock::new(&self.key)?;
        match self.mode {
            CipherMode::Encrypt => Ok(cts_encrypt(&cipher, self.iv, &data)),
            CipherMode::Decrypt => cts_decrypt(&cipher, self.iv, &data),
        }
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        // Ciphertext stealing never changes the message length.
        self.scratch.len() + final_input_len
    }
}

/// CBC-CS3 encrypt: normal CBC over all but the last two blocks, then the
/// standard ciphertext-stealing swap for the final (possibly partial) block.
fn cts_encrypt(cipher: &AesBlock, mut iv: [u8; 16], data: &[u8]) -> Vec<u8> {
    let d = data.len() % 16;
    let d = if d == 0 { 16 } else { d };
    let full_len = data.len() - d;
    let penultimate_start = full_len - 16;

    let mut out = Vec::with_capacity(data.len());
    // Normal CBC over blocks 1..n-2 (everything strictly before the
    // second-to-last full block).
    let mut i = 0;
    while i < penultimate_start {
        let mut block = [0u8; 16];
        block.copy_from_slice(&data[i..i + 16]);
        xor16(&mut block, &iv);
        cipher.encrypt_block(&mut block);
        iv = block;
        out.extend_from_slice(&block);
        i += 16;
    }

    // Second-to-last full block P_{n-1}: normal CBC step, result is `x`.
    let mut p_prev = [0u8; 16];
    p_prev.copy_from_slice(&data[penultimate_start..penultimate_start + 16]);
    let mut x = p_prev;
    xor16(&mut x, &iv);
    cipher.encrypt_block(&mut x);

    // Last (possibly partial) block P_n, zero-padded.
    let mut p_last_padded = [0u8; 16];
    p_last_padded[..d].copy_from_slice(&data[full_len..full_len + d]);
    let mut y_full = p_last_padded;
    xor16(&mut y_full, &x);
    cipher.encrypt_block(&mut y_full);

    // Output order: x (full 16 bytes) then first d bytes of y_full.
    out.extend_from_slice(&x);
    out.extend_from_slice(&y_full[..d]);
    out
}

fn cts_decrypt(cipher: &AesBlock, mut iv: [u8; 16], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    if data.len() < 17 {
        return Err(ProviderError::OperationFailed("CTS requires more than one block".into()));
    }
    let d = data.len() % 16;
    let d = if d == 0 { 16 } else { d };
    let full_len = data.len() - d - 16;

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < full_len {
        let mut block = [0u8; 16];
        block.copy_from_slice(&data[i..i + 16]);
        let ct = block;
        cipher.decrypt_block(&mut block);
        xor16(&mut block, &iv);
        iv = ct;
        out.extend_from_slice(&block);
        i += 16;
    }

    // x = the full 16-byte block at position n-1 in the stream.
    let mut x = [0u8; 16];
    x.copy_from_slice(&data[full_len..full_len + 16]);
    // stolen d bytes at the end of the stream.
    let stolen = &data[full_len + 16..full_len + 16 + d];

    let dn = {
        let mut b = x;
        cipher.decrypt_block(&mut b);
        b
    };
    // Recover the missing tail of C'_{n-1}: equals Dn's tail since the
    // padded plaintext's tail is zero.
    let mut c_prev_full = [0u8; 16];
    c_prev_full[..d].copy_from_slice(stolen);
    c_prev_full[d..].copy_from_slice(&dn[d..]);

    // Recover P_n (first d bytes) = Dn[0..d] XOR stolen.
    let mut p_last = vec![0u8; d];
    for k in 0..d {
        p_last[k] = dn[k] ^ stolen[k];
    }

    // Recover P_{n-1} = AES_Decrypt(c_prev_full) XOR iv (iv here is the
    // chaining value left over from the loop above, i.e. C_{n-2}).
    let mut p_prev = c_prev_full;
    cipher.decrypt_block(&mut p_prev);
    xor16(&mut p_prev, &iv);

    out.extend_from_slice(&p_prev);
    out.extend_from_slice(&p_last);
    Ok(out)
}

// ---------------------------------------------------------------------------
// CTR
// ---------------------------------------------------------------------------

fn make_ctr_operation(key: &[u8], iv: &[u8; 16]) -> Result<Box<dyn CipherOperation>, ProviderError> {
    match key.len() {
        16 => {
            let c = ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(|_| ProviderError::KeyPopulationFailed)?;
            Ok(Box::new(CtrOperation128(c)))
        }
        24 => {
            let c = ctr::Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(|_| ProviderError::KeyPopulationFailed)?;
            Ok(Box::new(CtrOperation192(c)))
        }
        32 => {
            let c = ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(|_| ProviderError::KeyPopulationFailed)?;
            Ok(Box::new(CtrOperation256(c)))
        }
        _ => Err(ProviderError::KeyPopulationFailed),
    }
}

struct CtrOperation128(ctr::Ctr128BE<Aes128>);
struct CtrOperation192(ctr::Ctr128BE<Aes192>);
struct CtrOperation256(ctr::Ctr128BE<Aes256>);

macro_rules! impl_ctr_operation {
    ($t:ty) => {
        impl CipherOperation for $t {
            fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
                let mut buf = input.to_vec();
                self.0.apply_keystream(&mut buf);
                Ok(buf)
            }

            fn finish(mut self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
                let mut buf = input.to_vec();
                self.0.apply_keystream(&mut buf);
                Ok(buf)
            }

            fn output_len(&self, final_input_len: usize) -> usize {
                // Streaming: every update() call already returned its own
                // output, there is no scratch left to account for.
                final_input_len
            }
        }
    };
}

impl_ctr_operation!(CtrOperation128);
impl_ctr_operation!(CtrOperation192);
impl_ctr_operation!(CtrOperation256);

// ---------------------------------------------------------------------------
// AE (CCM/GCM) — buffered until finish (see trait doc comments).
// ---------------------------------------------------------------------------

struct AeEncryptScratch {
    alg: AeAlgorithm,
    key: Vec<u8>,
    nonce: Vec<u8>,
    tag_len: usize,
    aad: Vec<u8>,
    scratch: Vec<u8>,
}

impl AeEncryptOperation for AeEncryptScratch {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError> {
        self.scratch.extend_from_slice(input);
        Ok(())
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut plaintext = self.scratch;
        plaintext.extend_from_slice(input);
        ae_seal(self.alg, &self.key, &self.nonce, &self.aad, &plaintext, self.tag_len)
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        self.scratch.len() + final_input_len + self.tag_len
    }
}

struct AeDecryptScratch {
    alg: AeAlgorithm,
    key: Vec<u8>,
    nonce: Vec<u8>,
    tag_len: usize,
    aad: Vec<u8>,
    scratch: Vec<u8>,
}

impl AeDecryptOperation for AeDecryptScratch {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError> {
        self.scratch.extend_from_slice(input);
        Ok(())
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut ciphertext_and_tag = self.scratch;
        ciphertext_and_tag.extend_from_slice(input);
        ae_open(self.alg, &self.key, &self.nonce, &self.aad, &ciphertext_and_tag, self.tag_len)
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        (self.scratch.len() + final_input_len).saturating_sub(self.tag_len)
    }
}

fn ae_seal(alg: AeAlgorithm, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8], tag_len: usize) -> Result<Vec<u8>, ProviderError> {
    match alg {
        AeAlgorithm::Gcm => gcm_seal(key, nonce, aad, plaintext),
        AeAlgorithm::Ccm => ccm_seal(key, nonce, aad, plaintext, tag_len),
    }
}

fn ae_open(alg: AeAlgorithm, key: &[u8], nonce: &[u8], aad: &[u8], ciphertext_and_tag: &[u8], tag_len: usize) -> Result<Vec<u8>, ProviderError> {
    match alg {
        AeAlgorithm::Gcm => gcm_open(key, nonce, aad, ciphertext_and_tag),
        AeAlgorithm::Ccm => ccm_open(key, nonce, aad, ciphertext_and_tag, tag_len),
    }
}

fn gcm_seal(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let payload = Payload { msg: plaintext, aad };
    let nonce = aes_gcm::Nonce::from_slice(nonce);
    match key.len() {
        16 => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.encrypt(nonce, payload).map_err(|_| ProviderError::OperationFailed("gcm encrypt failed".into()))
        }
        32 => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.encrypt(nonce, payload).map_err(|_| ProviderError::OperationFailed("gcm encrypt failed".into()))
        }
        _ => Err(ProviderError::KeyPopulationFailed),
    }
}

fn gcm_open(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext_and_tag: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let payload = Payload { msg: ciphertext_and_tag, aad };
    let nonce = aes_gcm::Nonce::from_slice(nonce);
    match key.len() {
        16 => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.decrypt(nonce, payload).map_err(|_| ProviderError::AuthenticationFailed)
        }
        32 => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.decrypt(nonce, payload).map_err(|_| ProviderError::AuthenticationFailed)
        }
        _ => Err(ProviderError::KeyPopulationFailed),
    }
}

type Aes128Ccm = Ccm<Aes128, U16, U12>;
type Aes256Ccm = Ccm<Aes256, U16, U12>;

fn ccm_seal(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8], _tag_len: usize) -> Result<Vec<u8>, ProviderError> {
    use ccm::aead::{Aead as CcmAead, KeyInit as CcmKeyInit};
    let payload = ccm::aead::Payload { msg: plaintext, aad };
    let nonce = GenericArray::<u8, typenum::U12>::from_slice(nonce);
    match key.len() {
        16 => {
            let cipher = Aes128Ccm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.encrypt(nonce, payload).map_err(|_| ProviderError::OperationFailed("ccm encrypt failed".into()))
        }
        32 => {
            let cipher = Aes256Ccm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.encrypt(nonce, payload).map_err(|_| ProviderError::OperationFailed("ccm encrypt failed".into()))
        }
        _ => Err(ProviderError::KeyPopulationFailed),
    }
}

fn ccm_open(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext_and_tag: &[u8], _tag_len: usize) -> Result<Vec<u8>, ProviderError> {
    use ccm::aead::{Aead as CcmAead, KeyInit as CcmKeyInit};
    let payload = ccm::aead::Payload { msg: ciphertext_and_tag, aad };
    let nonce = GenericArray::<u8, typenum::U12>::from_slice(nonce);
    match key.len() {
        16 => {
            let cipher = Aes128Ccm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.decrypt(nonce, payload).map_err(|_| ProviderError::AuthenticationFailed)
        }
        32 => {
            let cipher = Aes256Ccm::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
            cipher.decrypt(nonce, payload).map_err(|_| ProviderError::AuthenticationFailed)
        }
        _ => Err(ProviderError::KeyPopulationFailed),
    }
}

// ---------------------------------------------------------------------------
// MAC operations
// ---------------------------------------------------------------------------

struct CmacOperation {
    mac: Cmac<Aes128>,
}

impl CmacOperation {
    fn new(key: &[u8]) -> Result<Self, ProviderError> {
        let mac = Cmac::<Aes128>::new_from_slice(key).map_err(|_| ProviderError::KeyPopulationFailed)?;
        Ok(Self { mac })
    }
}

impl MacOperation for CmacOperation {
    fn update(&mut self, input: &[u8]) {
        Mac::update(&mut self.mac, input);
    }

    fn compute_final(self: Box<Self>) -> Vec<u8> {
        self.mac.finalize().into_bytes().to_vec()
    }

    fn compare_final(self: Box<Self>, expected: &[u8]) -> Result<(), ProviderError> {
        self.mac.verify_slice(expected).map_err(|_| ProviderError::AuthenticationFailed)
    }
}

struct HmacOperation<D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser + Clone> {
    mac: Hmac<D>,
}

impl<D> HmacOperation<D>
where
    D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser + Clone,
{
    fn new(key: &[u8]) -> Self {
        // HMAC accepts any key length (RFC 2104); this never fails.
        let mac = Hmac::<D>::new_from_slice(key).expect("HMAC accepts keys of any length");
        Self { mac }
    }
}

impl<D> MacOperation for HmacOperation<D>
where
    D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser + Clone + Send,
{
    fn update(&mut self, input: &[u8]) {
        Mac::update(&mut self.mac, input);
    }

    fn compute_final(self: Box<Self>) -> Vec<u8> {
        self.mac.finalize().into_bytes().to_vec()
    }

    fn compare_final(self: Box<Self>, expected: &[u8]) -> Result<(), ProviderError> {
        self.mac.verify_slice(expected).map_err(|_| ProviderError::AuthenticationFailed)
    }
}

// ---------------------------------------------------------------------------
// FakeProvider — deterministic substitute for tests (spec §9 "Provider
// abstraction... tests substitute a deterministic fake").
// ---------------------------------------------------------------------------

/// A deterministic, non-cryptographic stand-in for [`RustCryptoProvider`].
/// "Encryption" is a fixed-key XOR stream so ciphertexts are reproducible
/// across runs; "MAC" is a running XOR-fold. Never use outside tests.
#[derive(Default)]
pub struct FakeProvider;

struct FakeCipherOp {
    keystream_seed: u8,
}

impl CipherOperation for FakeCipherOp {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        Ok(self.xform(input))
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        Ok(self.xform(input))
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        final_input_len
    }
}

impl FakeCipherOp {
    fn xform(&self, input: &[u8]) -> Vec<u8> {
        // XOR is its own inverse, so encrypt and decrypt share one path.
        input.iter().map(|b| b ^ self.keystream_seed).collect()
    }
}

struct FakeAeEncryptOp {
    scratch: Vec<u8>,
    tag_len: usize,
}

impl AeEncryptOperation for FakeAeEncryptOp {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError> {
        self.scratch.extend_from_slice(input);
        Ok(())
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut plaintext = self.scratch;
        plaintext.extend_from_slice(input);
        let mut out: Vec<u8> = plaintext.iter().map(|b| b ^ 0xA5).collect();
        out.extend(std::iter::repeat(0x5A).take(self.tag_len));
        Ok(out)
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        self.scratch.len() + final_input_len + self.tag_len
    }
}

struct FakeAeDecryptOp {
    scratch: Vec<u8>,
    tag_len: usize,
}

impl AeDecryptOperation for FakeAeDecryptOp {
    fn update(&mut self, input: &[u8]) -> Result<(), ProviderError> {
        self.scratch.extend_from_slice(input);
        Ok(())
    }

    fn finish(self: Box<Self>, input: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut data = self.scratch;
        data.extend_from_slice(input);
        if data.len() < self.tag_len {
            return Err(ProviderError::AuthenticationFailed);
        }
        let split = data.len() - self.tag_len;
        let (ct, tag) = data.split_at(split);
        if tag.iter().any(|b| *b != 0x5A) {
            return Err(ProviderError::AuthenticationFailed);
        }
        Ok(ct.iter().map(|b| b ^ 0xA5).collect())
    }

    fn output_len(&self, final_input_len: usize) -> usize {
        (self.scratch.len() + final_input_len).saturating_sub(self.tag_len)
    }
}

struct FakeMacOp {
    acc: u8,
}

impl MacOperation for FakeMacOp {
    fn update(&mut self, input: &[u8]) {
        for b in input {
            self.acc ^= b;
        }
    }

    fn compute_final(self: Box<Self>) -> Vec<u8> {
        vec![self.acc]
    }

    fn compare_final(self: Box<Self>, expected: &[u8]) -> Result<(), ProviderError> {
        if expected == [self.acc] {
            Ok(())
        } else {
            Err(ProviderError::AuthenticationFailed)
        }
    }
}

impl CryptoProvider for FakeProvider {
    fn allocate_transient_key(&self, key_type: KeyType) -> Result<TransientKey, ProviderError> {
        Ok(TransientKey { key_type, value: Vec::new() })
    }

    fn populate_transient_key(&self, key: &mut TransientKey, value: &[u8]) -> Result<(), ProviderError> {
        key.value.zeroize();
        key.value = value.to_vec();
        Ok(())
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, ProviderError> {
        Ok(vec![0x42; len])
    }

    fn cipher_init(
        &self,
        _alg: CipherAlgorithm,
        _mode: CipherMode,
        key: &TransientKey,
        _params: &CipherParams,
    ) -> Result<Box<dyn CipherOperation>, ProviderError> {
        let seed = key.value().first().copied().unwrap_or(0xFF);
        Ok(Box::new(FakeCipherOp { keystream_seed: seed }))
    }

    fn ae_encrypt_init(
        &self,
        _alg: AeAlgorithm,
        _key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeEncryptOperation>, ProviderError> {
        Ok(Box::new(FakeAeEncryptOp { scratch: Vec::new(), tag_len: params.tag_len }))
    }

    fn ae_decrypt_init(
        &self,
        _alg: AeAlgorithm,
        _key: &TransientKey,
        params: &AeParams,
    ) -> Result<Box<dyn AeDecryptOperation>, ProviderError> {
        Ok(Box::new(FakeAeDecryptOp { scratch: Vec::new(), tag_len: params.tag_len }))
    }

    fn mac_init(&self, _alg: MacAlgorithm, _key: &TransientKey) -> Result<Box<dyn MacOperation>, ProviderError> {
        Ok(Box::new(FakeMacOp { acc: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // spec §8 scenario 2: AES-128-ECB of 16 zero bytes under key
    // 00112233445566778899aabbccddeeff.
    #[test]
    fn ecb_known_answer() {
        let key = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();
        let op = provider
            .cipher_init(CipherAlgorithm::EcbNoPad, CipherMode::Encrypt, &tk, &CipherParams { iv: None })
            .unwrap();
        let ct = op.finish(&[0u8; 16]).unwrap();
        assert_eq!(hex::encode(ct), "66e94bd4ef8a2c3b884cfa59ca342b2e");
    }

    #[test]
    fn cbc_encrypt_decrypt_roundtrip() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();

        let plaintext = b"0123456789abcdef0123456789abcdef";
        let enc = provider
            .cipher_init(CipherAlgorithm::CbcNoPad, CipherMode::Encrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let ct = enc.finish(plaintext).unwrap();

        let dec = provider
            .cipher_init(CipherAlgorithm::CbcNoPad, CipherMode::Decrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn cts_encrypt_decrypt_roundtrip_nonaligned() {
        let key = [0x33u8; 16];
        let iv = [0x00u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();

        let plaintext = b"this message is definitely not a multiple of 16b";
        let enc = provider
            .cipher_init(CipherAlgorithm::Cts, CipherMode::Encrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let ct = enc.finish(plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len());

        let dec = provider
            .cipher_init(CipherAlgorithm::Cts, CipherMode::Decrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn ctr_encrypt_decrypt_roundtrip() {
        let key = [0x44u8; 16];
        let iv = [0x01u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();

        let plaintext = b"streaming ctr data of arbitrary length!";
        let enc = provider
            .cipher_init(CipherAlgorithm::Ctr, CipherMode::Encrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let ct = enc.finish(plaintext).unwrap();

        let dec = provider
            .cipher_init(CipherAlgorithm::Ctr, CipherMode::Decrypt, &tk, &CipherParams { iv: Some(iv) })
            .unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn gcm_round_trip_and_tamper() {
        let key = [0x55u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();
        let params = AeParams { nonce: vec![0x01; 12], tag_len: 16, aad: b"header".to_vec() };

        let enc = provider.ae_encrypt_init(AeAlgorithm::Gcm, &tk, &params).unwrap();
        let ct = enc.finish(b"abcdef").unwrap();

        let dec = provider.ae_decrypt_init(AeAlgorithm::Gcm, &tk, &params).unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, b"abcdef");

        let mut tampered = ct.clone();
        tampered[0] ^= 0x01;
        let dec2 = provider.ae_decrypt_init(AeAlgorithm::Gcm, &tk, &params).unwrap();
        assert!(dec2.finish(&tampered).is_err());
    }

    #[test]
    fn ccm_round_trip() {
        let key = [0x66u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();
        let params = AeParams { nonce: vec![0x02; 12], tag_len: 16, aad: Vec::new() };

        let enc = provider.ae_encrypt_init(AeAlgorithm::Ccm, &tk, &params).unwrap();
        let ct = enc.finish(b"ccm payload").unwrap();

        let dec = provider.ae_decrypt_init(AeAlgorithm::Ccm, &tk, &params).unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, b"ccm payload");
    }

    #[test]
    fn cmac_compute_and_compare() {
        let key = [0x77u8; 16];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();

        let mut op = provider.mac_init(MacAlgorithm::CmacAes, &tk).unwrap();
        op.update(b"message");
        let tag = op.compute_final();

        let mut op2 = provider.mac_init(MacAlgorithm::CmacAes, &tk).unwrap();
        op2.update(b"message");
        assert!(op2.compare_final(&tag).is_ok());
    }

    #[test]
    fn hmac_sha256_compute_and_compare() {
        let key = [0x88u8; 32];
        let provider = RustCryptoProvider;
        let mut tk = provider.allocate_transient_key(KeyType::GenericSecret).unwrap();
        provider.populate_transient_key(&mut tk, &key).unwrap();

        let mut op = provider.mac_init(MacAlgorithm::HmacSha256, &tk).unwrap();
        op.update(b"authenticate me");
        let tag = op.compute_final();
        assert_eq!(tag.len(), 32);

        let mut op2 = provider.mac_init(MacAlgorithm::HmacSha256, &tk).unwrap();
        op2.update(b"authenticate me");
        assert!(op2.compare_final(&tag).is_ok());
    }

    #[test]
    fn fake_provider_cipher_roundtrip() {
        let provider = FakeProvider;
        let mut tk = provider.allocate_transient_key(KeyType::Aes).unwrap();
        provider.populate_transient_key(&mut tk, &[9u8; 16]).unwrap();

        let enc = provider
            .cipher_init(CipherAlgorithm::EcbNoPad, CipherMode::Encrypt, &tk, &CipherParams { iv: None })
            .unwrap();
        let ct = enc.finish(b"plaintext-bytes!").unwrap();
        let dec = provider
            .cipher_init(CipherAlgorithm::EcbNoPad, CipherMode::Decrypt, &tk, &CipherParams { iv: None })
            .unwrap();
        let pt = dec.finish(&ct).unwrap();
        assert_eq!(pt, b"plaintext-bytes!");
    }
}
