//! Upgrade images staged in storage slots.
//!
//! [`StorageUpgradeLocator::check_for_upgrade`] walks each slot through the
//! parser with signature math skipped, so it answers "is there a complete
//! image" cheaply. [`StorageUpgradeLocator::apply_upgrade`] parses again with
//! full authentication and writes the application through a [`FlashInstaller`].

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::config::{BootConfig, FlashRegion, StorageSlot};
use crate::error::{InstallError, ParseError};
use crate::parser::format::TAG_HEADER_V3;
use crate::parser::{NoCallbacks, ParseOutcome, ParserCallbacks, ParserConfig, ParserContext};
use crate::security::{ImageDecryptor, SignatureVerifier};

const READ_CHUNK: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpgradeError {
    NotFound,
    /// Storage device read failure.
    Storage,
    /// Slot ended before the image did.
    Incomplete,
    Rejected(ParseError),
}

/// Where the decision engine gets upgrade images from.
pub trait UpgradeSource {
    /// True if some slot holds a structurally complete image.
    fn check_for_upgrade(&mut self) -> bool;
    /// Authenticates and installs the located image.
    fn apply_upgrade(&mut self) -> Result<(), UpgradeError>;
}

/// Accepts every signature. Used for structure-only scans.
struct StructureOnly;

impl SignatureVerifier for StructureOnly {
    fn verify(&self, _: &[u8; 64], _: &[u8; 32], _: &[u8; 64]) -> bool {
        true
    }
}

/// Tracks how far a flash target has been erased so each page is erased
/// once, right before its first write.
struct EraseCursor {
    region: FlashRegion,
    erased_until: u32,
}

impl EraseCursor {
    fn new(region: FlashRegion) -> Self {
        Self {
            region,
            erased_until: region.start,
        }
    }

    fn write<F: NorFlash>(
        &mut self,
        flash: &mut F,
        flash_base: u32,
        address: u32,
        data: &[u8],
    ) -> Result<(), InstallError> {
        let len = data.len() as u32;
        if !self.region.contains_range(address, len) {
            warn!("install: {:#x}+{} outside {:#x}..{:#x}", address, len, self.region.start, self.region.end);
            return Err(InstallError);
        }
        let end = address + len;
        if end > self.erased_until {
            let page = F::ERASE_SIZE as u32;
            let from = self.erased_until.max(address);
            let from = from - (from - flash_base) % page;
            let to = end + (page - (end - flash_base) % page) % page;
            flash
                .erase(from - flash_base, to - flash_base)
                .map_err(|_| InstallError)?;
            self.erased_until = to;
        }
        flash.write(address - flash_base, data).map_err(|_| InstallError)
    }
}

/// Parser callbacks writing application data, and optionally a staged
/// bootloader, into flash.
pub struct FlashInstaller<'f, F> {
    flash: &'f mut F,
    flash_base: u32,
    application: EraseCursor,
    bootloader: Option<EraseCursor>,
}

impl<'f, F: NorFlash> FlashInstaller<'f, F> {
    pub fn new(flash: &'f mut F, config: &BootConfig) -> Self {
        let bootloader = config.bootloader_upgrade_location.map(|location| {
            EraseCursor::new(FlashRegion::new(location, location + config.bootloader.len()))
        });
        Self {
            flash,
            flash_base: config.flash_base,
            application: EraseCursor::new(config.application),
            bootloader,
        }
    }
}

impl<F: NorFlash> ParserCallbacks for FlashInstaller<'_, F> {
    fn accepts_application(&self) -> bool {
        true
    }

    fn application_data(&mut self, address: u32, data: &[u8]) -> Result<(), InstallError> {
        self.application
            .write(self.flash, self.flash_base, address, data)
    }

    fn bootloader_data(&mut self, offset: u32, data: &[u8]) -> Result<(), InstallError> {
        let Some(cursor) = self.bootloader.as_mut() else {
            warn!("install: image carries a bootloader but no upgrade location is configured");
            return Err(InstallError);
        };
        let address = cursor.region.start + offset;
        cursor.write(self.flash, self.flash_base, address, data)
    }
}

fn stream_slot<S: ReadNorFlash>(
    storage: &mut S,
    slot: StorageSlot,
    ctx: &mut ParserContext<'_>,
    callbacks: &mut dyn ParserCallbacks,
) -> Result<(), UpgradeError> {
    let mut magic = [0u8; 4];
    storage
        .read(slot.address, &mut magic)
        .map_err(|_| UpgradeError::Storage)?;
    if u32::from_le_bytes(magic) != TAG_HEADER_V3 {
        return Err(UpgradeError::NotFound);
    }

    let mut chunk = [0u8; READ_CHUNK];
    let mut offset = 0;
    while offset < slot.size {
        let len = (slot.size - offset).min(READ_CHUNK as u32) as usize;
        storage
            .read(slot.address + offset, &mut chunk[..len])
            .map_err(|_| UpgradeError::Storage)?;
        match ctx.parse_buffer(&chunk[..len], callbacks) {
            ParseOutcome::Continue => offset += len as u32,
            ParseOutcome::Success => return Ok(()),
            ParseOutcome::Failed(e) => return Err(UpgradeError::Rejected(e)),
        }
    }
    Err(UpgradeError::Incomplete)
}

pub struct StorageUpgradeLocator<'a, S, F> {
    config: &'a BootConfig,
    parser_config: &'a ParserConfig,
    verifier: &'a dyn SignatureVerifier,
    decryptor: Option<&'a mut dyn ImageDecryptor>,
    storage: S,
    flash: F,
    found: Option<StorageSlot>,
}

impl<'a, S: ReadNorFlash, F: NorFlash> StorageUpgradeLocator<'a, S, F> {
    pub fn new(
        config: &'a BootConfig,
        parser_config: &'a ParserConfig,
        verifier: &'a dyn SignatureVerifier,
        storage: S,
        flash: F,
    ) -> Self {
        Self {
            config,
            parser_config,
            verifier,
            decryptor: None,
            storage,
            flash,
            found: None,
        }
    }

    pub fn with_decryptor(mut self, decryptor: &'a mut dyn ImageDecryptor) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Slot found by the last successful [`UpgradeSource::check_for_upgrade`].
    pub fn upgrade_slot(&self) -> Option<StorageSlot> {
        self.found
    }

    pub fn release(self) -> (S, F) {
        (self.storage, self.flash)
    }
}

impl<S: ReadNorFlash, F: NorFlash> UpgradeSource for StorageUpgradeLocator<'_, S, F> {
    fn check_for_upgrade(&mut self) -> bool {
        self.found = None;
        for &slot in self.config.storage_slots {
            let mut ctx = ParserContext::new(self.parser_config, &StructureOnly);
            if let Some(decryptor) = self.decryptor.as_deref_mut() {
                ctx = ctx.with_decryptor(decryptor);
            }
            match stream_slot(&mut self.storage, slot, &mut ctx, &mut NoCallbacks) {
                Ok(()) => {
                    info!("storage: upgrade image in slot at {:#x}", slot.address);
                    self.found = Some(slot);
                    return true;
                }
                Err(e) => debug!("storage: slot at {:#x}: {}", slot.address, e),
            }
        }
        false
    }

    fn apply_upgrade(&mut self) -> Result<(), UpgradeError> {
        if self.found.is_none() && !self.check_for_upgrade() {
            return Err(UpgradeError::NotFound);
        }
        let slot = self.found.ok_or(UpgradeError::NotFound)?;

        let mut ctx = ParserContext::new(self.parser_config, self.verifier);
        if let Some(decryptor) = self.decryptor.as_deref_mut() {
            ctx = ctx.with_decryptor(decryptor);
        }
        let mut installer = FlashInstaller::new(&mut self.flash, self.config);
        let result = stream_slot(&mut self.storage, slot, &mut ctx, &mut installer);
        match result {
            Ok(()) => {
                let props = ctx.properties();
                info!(
                    "storage: upgrade installed, app version {} verified={}",
                    props.application.version, props.image_verified
                );
            }
            Err(e) => warn!("storage: upgrade failed: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capabilities;
    use crate::parser::format::TYPE_SIGNATURE_ECDSA;
    use crate::testutil::{
        app_data, app_payload, boot_config, signed_app_image, CountingVerifier, GblBuilder,
        MockFlash, XorDecryptor, APP_START, BOOTLOADER_BASE, FLASH_BASE, SLOTS,
    };

    const FLASH_SIZE: usize = 0x4_0000;
    const APP_OFFSET: usize = (APP_START - FLASH_BASE) as usize;

    fn storage_with(slot: usize, image: &[u8]) -> MockFlash {
        MockFlash::with_contents(0x4000, SLOTS[slot].address, image)
    }

    #[test]
    fn finds_image_in_second_slot() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let storage = storage_with(1, &signed_app_image(&app_payload(256)));
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage,
            MockFlash::new(FLASH_SIZE),
        );

        assert!(locator.check_for_upgrade());
        assert_eq!(locator.upgrade_slot(), Some(SLOTS[1]));
        // Structure only.
        assert_eq!(verifier.calls.get(), 0);
    }

    #[test]
    fn blank_storage() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            MockFlash::new(0x4000),
            MockFlash::new(FLASH_SIZE),
        );

        assert!(!locator.check_for_upgrade());
        assert_eq!(locator.apply_upgrade(), Err(UpgradeError::NotFound));
    }

    #[test]
    fn installs_application() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let payload = app_payload(0x500);
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(0, &signed_app_image(&payload)),
            MockFlash::new(FLASH_SIZE),
        );

        assert_eq!(locator.apply_upgrade(), Ok(()));
        assert_eq!(verifier.calls.get(), 1);

        let (_, flash) = locator.release();
        assert_eq!(&flash.data[APP_OFFSET..APP_OFFSET + payload.len()], &payload[..]);
        assert_eq!(flash.erases, [(0x1_0000, 0x1_0400), (0x1_0400, 0x1_0800)]);
    }

    #[test]
    fn tampered_image_is_found_but_not_installed() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let payload = app_payload(256);
        let mut image = signed_app_image(&payload);
        let at = image.len() - 40;
        image[at] ^= 0x02;
        // Keep the checksum valid so only the signature is wrong.
        let body = image.len() - 4;
        let crc = crate::security::CRC32.checksum(&image[..body]);
        image[body..].copy_from_slice(&crc.to_le_bytes());

        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(0, &image),
            MockFlash::new(FLASH_SIZE),
        );

        assert!(locator.check_for_upgrade());
        assert_eq!(
            locator.apply_upgrade(),
            Err(UpgradeError::Rejected(ParseError::Signature))
        );
        let (_, flash) = locator.release();
        // Reset vector never released.
        assert_eq!(&flash.data[APP_OFFSET + 4..APP_OFFSET + 8], &[0xFF; 4]);
    }

    #[test]
    fn storage_errors_degrade_to_not_found() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let mut storage = storage_with(0, &signed_app_image(&app_payload(64)));
        storage.fail_reads = true;
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage,
            MockFlash::new(FLASH_SIZE),
        );

        assert!(!locator.check_for_upgrade());
        assert!(locator.apply_upgrade().is_err());
    }

    #[test]
    fn older_image_leaves_installed_application_intact() {
        let config = boot_config(
            Capabilities::ENFORCE_UPGRADE_SIGNATURE | Capabilities::ROLLBACK_PROTECTION,
        );
        let parser_config = config.parser_config(Some(5));
        let verifier = CountingVerifier::default();
        let installed = app_payload(0x100);
        let image = GblBuilder::new(TYPE_SIGNATURE_ECDSA)
            .prog(APP_START, &[0u8; 0x100])
            .application(&app_data(3))
            .sign()
            .finish();
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(0, &image),
            MockFlash::with_contents(FLASH_SIZE, APP_OFFSET as u32, &installed),
        );

        assert!(locator.check_for_upgrade());
        assert_eq!(
            locator.apply_upgrade(),
            Err(UpgradeError::Rejected(ParseError::Rejected))
        );
        let (_, flash) = locator.release();
        assert!(flash.erases.is_empty());
        assert_eq!(&flash.data[APP_OFFSET..APP_OFFSET + installed.len()], &installed[..]);
    }

    #[test]
    fn writes_outside_application_are_refused() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let image = GblBuilder::new(TYPE_SIGNATURE_ECDSA)
            .application(&app_data(1))
            .prog(BOOTLOADER_BASE, &[0u8; 64])
            .sign()
            .finish();
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(0, &image),
            MockFlash::new(FLASH_SIZE),
        );

        assert_eq!(
            locator.apply_upgrade(),
            Err(UpgradeError::Rejected(ParseError::Install))
        );
    }

    #[test]
    fn truncated_slot() {
        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let image = signed_app_image(&app_payload(0x2400));
        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(0, &image[..0x2000]),
            MockFlash::new(FLASH_SIZE),
        );

        assert!(!locator.check_for_upgrade());
    }

    #[test]
    fn encrypted_upgrade() {
        use crate::parser::format::{TYPE_ENCRYPTION_AESCCM, TAG_APPLICATION};
        use crate::testutil::{prog_tag, raw_tag};

        let config = boot_config(Capabilities::ENFORCE_UPGRADE_SIGNATURE);
        let parser_config = config.parser_config(None);
        let verifier = CountingVerifier::default();
        let payload = app_payload(200);
        let mut inner = raw_tag(TAG_APPLICATION, &app_data(1).to_le_bytes());
        inner.extend_from_slice(&prog_tag(APP_START, &payload));
        let image = GblBuilder::new(TYPE_SIGNATURE_ECDSA | TYPE_ENCRYPTION_AESCCM)
            .encrypted(0x11, &inner)
            .sign()
            .finish();
        let mut decryptor = XorDecryptor::new(0x11);

        let mut locator = StorageUpgradeLocator::new(
            &config,
            &parser_config,
            &verifier,
            storage_with(1, &image),
            MockFlash::new(FLASH_SIZE),
        )
        .with_decryptor(&mut decryptor);

        assert_eq!(locator.apply_upgrade(), Ok(()));
        let (_, flash) = locator.release();
        assert_eq!(&flash.data[APP_OFFSET..APP_OFFSET + payload.len()], &payload[..]);
    }
}
