//! Fixtures shared by the unit tests: signed GBL images, flash and memory mocks.

use std::cell::Cell;
use std::vec;
use std::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::config::{BootConfig, Capabilities, FlashRegion, StorageSlot};
use crate::parser::format::*;
use crate::parser::{ParserCallbacks, ParserConfig};
use crate::error::InstallError;
use crate::props::ApplicationData;
use crate::security::{ImageDecryptor, SignatureVerifier, CRC32};
use crate::verify::MemoryMap;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const BOOTLOADER_BASE: u32 = 0x0800_0000;
pub const APP_START: u32 = 0x0801_0000;
pub const APP_END: u32 = 0x0804_0000;

pub static SLOTS: [StorageSlot; 2] = [
    StorageSlot {
        address: 0x0000,
        size: 0x2000,
    },
    StorageSlot {
        address: 0x2000,
        size: 0x2000,
    },
];

pub fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x42; 32]).unwrap()
}

pub fn public_key() -> [u8; 64] {
    let point = signing_key().verifying_key().to_encoded_point(false);
    let mut key = [0u8; 64];
    key.copy_from_slice(&point.as_bytes()[1..]);
    key
}

pub fn sign(digest: &[u8; 32]) -> [u8; 64] {
    let signature: Signature = signing_key().sign_prehash(digest).unwrap();
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn boot_config(capabilities: Capabilities) -> BootConfig {
    BootConfig {
        version: 0x0001_0000,
        flash_base: FLASH_BASE,
        bootloader: FlashRegion::new(BOOTLOADER_BASE, APP_START),
        application: FlashRegion::new(APP_START, APP_END),
        bootloader_upgrade_location: None,
        storage_slots: &SLOTS,
        public_key: public_key(),
        capabilities,
        lock_bootloader_on_exit: true,
        lock_application_on_exit: false,
        reset_counter_limit: 2,
        recovery_delay_ms: 500,
    }
}

pub fn parser_config() -> ParserConfig {
    boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE).parser_config(None)
}

pub fn app_data(version: u32) -> ApplicationData {
    ApplicationData {
        app_type: 1,
        version,
        capabilities: 0,
        product_id: [0x5A; 16],
    }
}

/// A plausible application: stack pointer, thumb reset handler, filler.
pub fn app_payload(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&0x2002_0000u32.to_le_bytes());
    out.extend_from_slice(&(APP_START + 0x101).to_le_bytes());
    for i in 8..len {
        out.push((i * 7 + 3) as u8);
    }
    out
}

pub fn raw_tag(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn prog_tag(address: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = address.to_le_bytes().to_vec();
    payload.extend_from_slice(data);
    raw_tag(TAG_PROG, &payload)
}

/// Keystream `key + position`, restarted by `start`.
pub struct XorDecryptor {
    pub key: u8,
    pub position: usize,
    pub nonce: Option<[u8; 12]>,
}

impl XorDecryptor {
    pub fn new(key: u8) -> Self {
        Self {
            key,
            position: 0,
            nonce: None,
        }
    }

    pub fn encrypt(key: u8, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let mut cipher = Self::new(key);
        cipher.apply(&mut out);
        out
    }
}

impl ImageDecryptor for XorDecryptor {
    fn start(&mut self, nonce: &[u8; 12]) {
        self.nonce = Some(*nonce);
        self.position = 0;
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.key.wrapping_add(self.position as u8);
            self.position += 1;
        }
    }
}

pub struct GblBuilder {
    bytes: Vec<u8>,
}

impl GblBuilder {
    pub fn new(image_type: u32) -> Self {
        Self::with_version(VERSION_CURRENT, image_type)
    }

    pub fn with_version(version: u32, image_type: u32) -> Self {
        let mut header = version.to_le_bytes().to_vec();
        header.extend_from_slice(&image_type.to_le_bytes());
        Self {
            bytes: raw_tag(TAG_HEADER_V3, &header),
        }
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn tag(self, id: u32, payload: &[u8]) -> Self {
        self.raw(&raw_tag(id, payload))
    }

    pub fn application(self, app: &ApplicationData) -> Self {
        self.tag(TAG_APPLICATION, &app.to_le_bytes())
    }

    pub fn prog(self, address: u32, data: &[u8]) -> Self {
        self.raw(&prog_tag(address, data))
    }

    pub fn bootloader(self, version: u32, base: u32, data: &[u8]) -> Self {
        let mut payload = version.to_le_bytes().to_vec();
        payload.extend_from_slice(&base.to_le_bytes());
        payload.extend_from_slice(data);
        self.tag(TAG_BOOTLOADER, &payload)
    }

    pub fn metadata(self, data: &[u8]) -> Self {
        self.tag(TAG_METADATA, data)
    }

    /// Wraps already encoded `inner` tags in an encrypted container.
    pub fn encrypted(self, key: u8, inner: &[u8]) -> Self {
        let mut init = (inner.len() as u32).to_le_bytes().to_vec();
        init.extend_from_slice(&[0xA5; 12]);
        self.tag(TAG_ENC_INIT, &init)
            .tag(TAG_ENC_GBL_DATA, &XorDecryptor::encrypt(key, inner))
    }

    /// Signs everything written so far.
    pub fn sign(self) -> Self {
        let signature = sign(&sha256(&self.bytes));
        self.tag(TAG_SIGNATURE_ECDSA_P256, &signature)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(&TAG_END.to_le_bytes());
        self.bytes.extend_from_slice(&4u32.to_le_bytes());
        let crc = CRC32.checksum(&self.bytes);
        self.bytes.extend_from_slice(&crc.to_le_bytes());
        self.bytes
    }
}

pub fn signed_app_image(payload: &[u8]) -> Vec<u8> {
    GblBuilder::new(TYPE_SIGNATURE_ECDSA)
        .application(&app_data(3))
        .prog(APP_START, payload)
        .sign()
        .finish()
}

/// P-256 verifier that counts its invocations.
#[derive(Default)]
pub struct CountingVerifier {
    pub calls: Cell<u32>,
}

impl SignatureVerifier for CountingVerifier {
    fn verify(&self, public_key: &[u8; 64], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
        self.calls.set(self.calls.get() + 1);
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(public_key);
        let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}

/// Records every callback and can replay application writes onto erased flash.
#[derive(Default)]
pub struct Recorder {
    pub application: Vec<(u32, Vec<u8>)>,
    pub bootloader: Vec<(u32, Vec<u8>)>,
    pub metadata: Vec<u8>,
}

impl Recorder {
    /// Application writes applied with NOR semantics to `len` erased bytes at `base`.
    pub fn flash(&self, base: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0xFF; len];
        for (address, data) in &self.application {
            let at = (address - base) as usize;
            for (dst, src) in out[at..at + data.len()].iter_mut().zip(data) {
                *dst &= *src;
            }
        }
        out
    }
}

impl ParserCallbacks for Recorder {
    fn accepts_application(&self) -> bool {
        true
    }

    fn application_data(&mut self, address: u32, data: &[u8]) -> Result<(), InstallError> {
        self.application.push((address, data.to_vec()));
        Ok(())
    }

    fn bootloader_data(&mut self, offset: u32, data: &[u8]) -> Result<(), InstallError> {
        self.bootloader.push((offset, data.to_vec()));
        Ok(())
    }

    fn metadata(&mut self, _offset: u32, data: &[u8]) -> Result<(), InstallError> {
        self.metadata.extend_from_slice(data);
        Ok(())
    }
}

/// RAM-backed NOR flash: erase sets 0xFF, writes can only clear bits.
pub struct MockFlash {
    pub data: Vec<u8>,
    pub fail_reads: bool,
    pub erases: Vec<(u32, u32)>,
}

impl MockFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            fail_reads: false,
            erases: Vec::new(),
        }
    }

    pub fn with_contents(size: usize, offset: u32, contents: &[u8]) -> Self {
        let mut flash = Self::new(size);
        let at = offset as usize;
        flash.data[at..at + contents.len()].copy_from_slice(contents);
        flash
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.fail_reads {
            return Err(NorFlashErrorKind::Other);
        }
        let at = offset as usize;
        let src = self
            .data
            .get(at..at + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 0x400;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if to as usize > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.data[from as usize..to as usize].fill(0xFF);
        self.erases.push((from, to));
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let at = offset as usize;
        let dst = self
            .data
            .get_mut(at..at + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        for (d, s) in dst.iter_mut().zip(bytes) {
            *d &= *s;
        }
        Ok(())
    }
}

/// Memory-mapped view of a byte vector placed at `base`.
pub struct MemoryImage {
    pub base: u32,
    pub bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn erased(base: u32, len: usize) -> Self {
        Self {
            base,
            bytes: vec![0xFF; len],
        }
    }

    pub fn write(&mut self, address: u32, data: &[u8]) {
        let at = (address - self.base) as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }
}

impl MemoryMap for MemoryImage {
    fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let at = address.checked_sub(self.base)? as usize;
        self.bytes.get(at..at.checked_add(len)?)
    }
}
