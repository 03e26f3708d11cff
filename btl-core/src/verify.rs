//! Verification of the application resident in flash before it is entered.

use sha2::{Digest, Sha256};

use crate::config::{BootConfig, Capabilities};
use crate::props::{
    ApplicationCertificate, ApplicationProperties, PROPERTIES_POINTER_OFFSET,
    SIGNATURE_CRC32, SIGNATURE_ECDSA_P256, SIGNATURE_NONE,
};
use crate::security::{SignatureVerifier, CRC32};

const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Read access to memory-mapped flash.
pub trait MemoryMap {
    /// Returns `len` bytes at `address`, or `None` if the range is not readable.
    fn read(&self, address: u32, len: usize) -> Option<&[u8]>;

    fn read_word(&self, address: u32) -> Option<u32> {
        let bytes = self.read(address, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Where and how to enter an application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppEntry {
    pub vector_table: u32,
    pub stack_pointer: u32,
    pub reset_handler: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyError {
    /// Reset vector reads as erased flash.
    Erased,
    /// Stack pointer or reset handler not plausible.
    BadVectorTable,
    /// Secure boot enforced but no properties block.
    MissingProperties,
    /// Secure boot enforced but the application is not signed.
    Unsigned,
    UnsupportedSignature,
    /// Signature location outside the application region.
    SignatureLocation,
    SignatureMismatch,
    ChecksumMismatch,
    BadCertificate,
}

pub struct ApplicationVerifier<'a, M: ?Sized, V: ?Sized> {
    config: &'a BootConfig,
    memory: &'a M,
    verifier: &'a V,
}

impl<'a, M, V> ApplicationVerifier<'a, M, V>
where
    M: MemoryMap + ?Sized,
    V: SignatureVerifier + ?Sized,
{
    pub fn new(config: &'a BootConfig, memory: &'a M, verifier: &'a V) -> Self {
        Self {
            config,
            memory,
            verifier,
        }
    }

    /// Cheap presence check: the reset vector is programmed.
    pub fn pc_sane(&self, base: u32) -> bool {
        matches!(self.memory.read_word(base + 4), Some(pc) if pc != ERASED_WORD)
    }

    /// Reads the initial stack pointer and reset handler.
    pub fn entry(&self, base: u32) -> Result<AppEntry, VerifyError> {
        let stack_pointer = self.memory.read_word(base).ok_or(VerifyError::BadVectorTable)?;
        let reset_handler = self
            .memory
            .read_word(base + 4)
            .ok_or(VerifyError::BadVectorTable)?;
        if reset_handler == ERASED_WORD {
            return Err(VerifyError::Erased);
        }
        if stack_pointer == ERASED_WORD
            || reset_handler & 1 == 0
            || !self.config.application.contains(reset_handler & !1)
        {
            return Err(VerifyError::BadVectorTable);
        }
        Ok(AppEntry {
            vector_table: base,
            stack_pointer,
            reset_handler,
        })
    }

    /// The properties block referenced from vector table word 13, if any.
    pub fn application_properties(&self, base: u32) -> Option<ApplicationProperties> {
        let pointer = self.memory.read_word(base + PROPERTIES_POINTER_OFFSET)?;
        let size = ApplicationProperties::SIZE;
        if !self.config.application.contains_range(pointer, size as u32) {
            return None;
        }
        ApplicationProperties::from_le_bytes(self.memory.read(pointer, size)?)
    }

    /// Version of the installed application, used as the rollback floor.
    pub fn installed_version(&self, base: u32) -> Option<u32> {
        self.application_properties(base).map(|props| props.app.version)
    }

    /// Full check of the application at `base`.
    ///
    /// The vector table is checked first so an erased region never reaches
    /// the signature verifier.
    pub fn verify_application(&self, base: u32) -> Result<AppEntry, VerifyError> {
        let entry = self.entry(base)?;
        let enforce = self
            .config
            .capabilities
            .contains(Capabilities::ENFORCE_SECURE_BOOT);

        let Some(props) = self.application_properties(base) else {
            return if enforce {
                Err(VerifyError::MissingProperties)
            } else {
                Ok(entry)
            };
        };

        match props.signature_type {
            SIGNATURE_NONE if enforce => Err(VerifyError::Unsigned),
            SIGNATURE_NONE => Ok(entry),
            SIGNATURE_ECDSA_P256 => self.check_ecdsa(base, &props).map(|()| entry),
            // A checksum is not authentication.
            SIGNATURE_CRC32 if enforce => Err(VerifyError::Unsigned),
            SIGNATURE_CRC32 => self.check_crc(base, &props).map(|()| entry),
            _ => Err(VerifyError::UnsupportedSignature),
        }
    }

    /// Bytes covered by the signature and the address of the signature itself.
    fn signed_region(
        &self,
        base: u32,
        props: &ApplicationProperties,
        trailer: u32,
    ) -> Result<(&'a [u8], u32), VerifyError> {
        let location = base
            .checked_add(props.signature_location)
            .ok_or(VerifyError::SignatureLocation)?;
        if location <= base || !self.config.application.contains_range(location, trailer) {
            return Err(VerifyError::SignatureLocation);
        }
        let signed = self
            .memory
            .read(base, (location - base) as usize)
            .ok_or(VerifyError::SignatureLocation)?;
        Ok((signed, location))
    }

    fn check_ecdsa(&self, base: u32, props: &ApplicationProperties) -> Result<(), VerifyError> {
        let (signed, location) = self.signed_region(base, props, 64)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(
            self.memory
                .read(location, 64)
                .ok_or(VerifyError::SignatureLocation)?,
        );

        let key = if self
            .config
            .capabilities
            .contains(Capabilities::ENFORCE_CERTIFICATE_SECURE_BOOT)
        {
            self.certified_key(props)?
        } else {
            self.config.public_key
        };

        if self.verifier.verify(&key, &sha256(signed), &signature) {
            Ok(())
        } else {
            Err(VerifyError::SignatureMismatch)
        }
    }

    /// Checks the certificate against the bootloader key and returns the key it certifies.
    fn certified_key(&self, props: &ApplicationProperties) -> Result<[u8; 64], VerifyError> {
        let size = ApplicationCertificate::SIZE;
        if !self
            .config
            .application
            .contains_range(props.certificate, size as u32)
        {
            return Err(VerifyError::BadCertificate);
        }
        let raw = self
            .memory
            .read(props.certificate, size)
            .ok_or(VerifyError::BadCertificate)?;
        let cert = ApplicationCertificate::from_le_bytes(raw).ok_or(VerifyError::BadCertificate)?;
        let digest = sha256(&raw[..ApplicationCertificate::SIGNED_LEN]);
        if !self
            .verifier
            .verify(&self.config.public_key, &digest, &cert.signature)
        {
            return Err(VerifyError::BadCertificate);
        }
        Ok(cert.key)
    }

    fn check_crc(&self, base: u32, props: &ApplicationProperties) -> Result<(), VerifyError> {
        let (signed, location) = self.signed_region(base, props, 4)?;
        let stored = self
            .memory
            .read_word(location)
            .ok_or(VerifyError::SignatureLocation)?;
        if CRC32.checksum(signed) == stored {
            Ok(())
        } else {
            Err(VerifyError::ChecksumMismatch)
        }
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        app_data, app_payload, boot_config, sign, CountingVerifier, MemoryImage, APP_START,
    };

    const PROPS_AT: u32 = APP_START + 0x200;
    const SIGNATURE_AT: u32 = 0x400;
    const CERT_AT: u32 = APP_START + 0x300;

    fn properties(signature_type: u32, certificate: u32) -> ApplicationProperties {
        ApplicationProperties {
            struct_version: 0x0201,
            signature_type,
            signature_location: SIGNATURE_AT,
            app: app_data(2),
            certificate,
            long_token_section_address: 0,
            decrypt_key: [0; 16],
        }
    }

    fn application(props: Option<ApplicationProperties>) -> MemoryImage {
        let mut memory = MemoryImage::erased(APP_START, 0x1000);
        let mut vectors = app_payload(0x200);
        let pointer = if props.is_some() { PROPS_AT } else { 0xFFFF_FFFF };
        vectors[52..56].copy_from_slice(&pointer.to_le_bytes());
        memory.write(APP_START, &vectors);
        if let Some(props) = props {
            memory.write(PROPS_AT, &props.to_le_bytes());
        }
        memory
    }

    fn seal(memory: &mut MemoryImage, signature_type: u32) {
        let signed = memory.bytes[..SIGNATURE_AT as usize].to_vec();
        let at = APP_START + SIGNATURE_AT;
        match signature_type {
            SIGNATURE_ECDSA_P256 => memory.write(at, &sign(&sha256(&signed))),
            SIGNATURE_CRC32 => memory.write(at, &CRC32.checksum(&signed).to_le_bytes()),
            _ => {}
        }
    }

    #[test]
    fn erased_application_never_reaches_crypto() {
        let config = boot_config(Capabilities::ENFORCE_SECURE_BOOT);
        let memory = MemoryImage::erased(APP_START, 0x1000);
        let verifier = CountingVerifier::default();
        let app = ApplicationVerifier::new(&config, &memory, &verifier);

        assert!(!app.pc_sane(APP_START));
        assert_eq!(app.verify_application(APP_START), Err(VerifyError::Erased));
        assert_eq!(verifier.calls.get(), 0);
    }

    #[test]
    fn signed_application() {
        let config = boot_config(Capabilities::ENFORCE_SECURE_BOOT);
        let mut memory = application(Some(properties(SIGNATURE_ECDSA_P256, 0)));
        seal(&mut memory, SIGNATURE_ECDSA_P256);
        let verifier = CountingVerifier::default();
        let app = ApplicationVerifier::new(&config, &memory, &verifier);

        let entry = app.verify_application(APP_START).unwrap();
        assert_eq!(entry.vector_table, APP_START);
        assert_eq!(entry.stack_pointer, 0x2002_0000);
        assert_eq!(entry.reset_handler, APP_START + 0x101);
        assert_eq!(verifier.calls.get(), 1);
        assert_eq!(app.installed_version(APP_START), Some(2));

        memory.bytes[0x300] ^= 0x01;
        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert_eq!(
            app.verify_application(APP_START),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn secure_boot_policy() {
        let verifier = CountingVerifier::default();
        let enforced = boot_config(Capabilities::ENFORCE_SECURE_BOOT);
        let relaxed = boot_config(Capabilities::empty());

        let bare = application(None);
        assert!(ApplicationVerifier::new(&relaxed, &bare, &verifier)
            .verify_application(APP_START)
            .is_ok());
        assert_eq!(
            ApplicationVerifier::new(&enforced, &bare, &verifier).verify_application(APP_START),
            Err(VerifyError::MissingProperties)
        );

        let unsigned = application(Some(properties(SIGNATURE_NONE, 0)));
        assert!(ApplicationVerifier::new(&relaxed, &unsigned, &verifier)
            .verify_application(APP_START)
            .is_ok());
        assert_eq!(
            ApplicationVerifier::new(&enforced, &unsigned, &verifier)
                .verify_application(APP_START),
            Err(VerifyError::Unsigned)
        );

        let odd = application(Some(properties(1 << 7, 0)));
        assert_eq!(
            ApplicationVerifier::new(&relaxed, &odd, &verifier).verify_application(APP_START),
            Err(VerifyError::UnsupportedSignature)
        );
        assert_eq!(verifier.calls.get(), 0);
    }

    #[test]
    fn crc_signed_application() {
        let config = boot_config(Capabilities::empty());
        let verifier = CountingVerifier::default();
        let mut memory = application(Some(properties(SIGNATURE_CRC32, 0)));
        seal(&mut memory, SIGNATURE_CRC32);

        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert!(app.verify_application(APP_START).is_ok());

        memory.bytes[0x10] ^= 0x80;
        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert_eq!(
            app.verify_application(APP_START),
            Err(VerifyError::ChecksumMismatch)
        );

        let enforced = boot_config(Capabilities::ENFORCE_SECURE_BOOT);
        let app = ApplicationVerifier::new(&enforced, &memory, &verifier);
        assert_eq!(app.verify_application(APP_START), Err(VerifyError::Unsigned));
    }

    #[test]
    fn signature_must_lie_in_application_region() {
        let config = boot_config(Capabilities::empty());
        let verifier = CountingVerifier::default();
        let mut props = properties(SIGNATURE_ECDSA_P256, 0);
        props.signature_location = 0x0010_0000;
        let memory = application(Some(props));

        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert_eq!(
            app.verify_application(APP_START),
            Err(VerifyError::SignatureLocation)
        );
    }

    #[test]
    fn bad_vector_table() {
        let config = boot_config(Capabilities::empty());
        let verifier = CountingVerifier::default();
        let mut memory = application(None);
        // Even address: not a thumb entry point.
        memory.write(APP_START + 4, &(APP_START + 0x100).to_le_bytes());

        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert!(app.pc_sane(APP_START));
        assert_eq!(
            app.verify_application(APP_START),
            Err(VerifyError::BadVectorTable)
        );
    }

    #[test]
    fn certificate_chain() {
        let config = boot_config(
            Capabilities::ENFORCE_SECURE_BOOT | Capabilities::ENFORCE_CERTIFICATE_SECURE_BOOT,
        );
        let verifier = CountingVerifier::default();
        let mut memory = application(Some(properties(SIGNATURE_ECDSA_P256, CERT_AT)));

        let mut cert = [0u8; ApplicationCertificate::SIZE];
        cert[0] = 1;
        cert[4..68].copy_from_slice(&config.public_key);
        cert[68..72].copy_from_slice(&1u32.to_le_bytes());
        let cert_signature = sign(&sha256(&cert[..ApplicationCertificate::SIGNED_LEN]));
        cert[72..].copy_from_slice(&cert_signature);
        memory.write(CERT_AT, &cert);
        seal(&mut memory, SIGNATURE_ECDSA_P256);

        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert!(app.verify_application(APP_START).is_ok());
        assert_eq!(verifier.calls.get(), 2);

        // Break the certificate signature, then re-seal so only the certificate is wrong.
        memory.bytes[(CERT_AT - APP_START) as usize + 100] ^= 0x01;
        seal(&mut memory, SIGNATURE_ECDSA_P256);
        let app = ApplicationVerifier::new(&config, &memory, &verifier);
        assert_eq!(
            app.verify_application(APP_START),
            Err(VerifyError::BadCertificate)
        );
    }
}
