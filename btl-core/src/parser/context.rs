use core::mem::{self, MaybeUninit};

use bitflags::bitflags;
use heapless::Deque;
use sha2::{Digest, Sha256};

use super::format::*;
use super::{
    ImageContents, ImageInfo, ImageProperties, NoCallbacks, ParseOutcome, ParserCallbacks,
    ParserConfig,
};
use crate::error::{ContextTooSmall, ParseError};
use crate::props::ApplicationData;
use crate::security::{ImageDecryptor, SignatureVerifier, CRC32, CRC32_RESIDUE};

/// Largest payload chunk handed to a callback. Also the carry-over capacity.
pub const CHUNK_SIZE: usize = 64;

const CONTEXT_MAGIC: u32 = 0x6B6C_4742;

/// Bytes a caller must reserve for [`ParserContext::init_in`], including
/// worst-case alignment padding.
pub const fn context_size() -> usize {
    mem::size_of::<ParserContext<'static>>() + mem::align_of::<ParserContext<'static>>() - 1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    Header,
    Idle,
    EncryptionInit,
    EncryptionContainer,
    Application,
    Bootloader,
    BootloaderData,
    Prog,
    ProgData,
    Metadata,
    MetadataData,
    Signature,
    Finalize,
    Done,
    Error(ParseError),
}

enum Step {
    Parsed,
    NeedMore,
}

bitflags! {
    #[derive(Clone, Copy)]
    struct Apply: u8 {
        const SHA = 1 << 0;
        const DECRYPT = 1 << 1;
    }
}

struct Input<'d> {
    data: &'d [u8],
    offset: usize,
}

impl Input<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

struct TagHeader {
    id: u32,
    length: u32,
}

fn le32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Pads `chunk[..len]` with `0xFF` up to a word boundary and returns the new length.
fn pad_to_word(chunk: &mut [u8], len: usize) -> usize {
    let padded = (len + 3) & !3;
    chunk[len..padded].fill(0xFF);
    padded
}

/// State of one GBL parse session.
pub struct ParserContext<'a> {
    magic: u32,
    config: &'a ParserConfig,
    verifier: &'a dyn SignatureVerifier,
    decryptor: Option<&'a mut dyn ImageDecryptor>,
    state: State,
    carry: Deque<u8, CHUNK_SIZE>,
    sha: Sha256,
    crc: crc::Digest<'static, u32>,
    tag_length: u32,
    tag_offset: u32,
    encrypted: bool,
    in_encrypted_container: bool,
    encrypted_length: u32,
    encrypted_offset: u32,
    signature_checked: bool,
    received_bootloader: bool,
    programmed: bool,
    /// Programming address for prog tags, payload offset for the others.
    address: u32,
    withheld_application: [u8; WITHHELD_APPLICATION_VECTORS],
    withheld_upgrade: [u8; 4],
    withheld_bootloader: [u8; 4],
    properties: ImageProperties,
}

impl<'a> ParserContext<'a> {
    pub fn new(config: &'a ParserConfig, verifier: &'a dyn SignatureVerifier) -> Self {
        Self {
            magic: CONTEXT_MAGIC,
            config,
            verifier,
            decryptor: None,
            state: State::Init,
            carry: Deque::new(),
            sha: Sha256::new(),
            crc: CRC32.digest(),
            tag_length: 0,
            tag_offset: 0,
            encrypted: false,
            in_encrypted_container: false,
            encrypted_length: 0,
            encrypted_offset: 0,
            signature_checked: false,
            received_bootloader: false,
            programmed: false,
            address: 0,
            withheld_application: [0xFF; WITHHELD_APPLICATION_VECTORS],
            withheld_upgrade: [0xFF; 4],
            withheld_bootloader: [0xFF; 4],
            properties: ImageProperties::default(),
        }
    }

    /// Enables encrypted images.
    pub fn with_decryptor(mut self, decryptor: &'a mut dyn ImageDecryptor) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Places a fresh context inside a caller-provided buffer.
    pub fn init_in<'b>(
        buffer: &'b mut [MaybeUninit<u8>],
        config: &'a ParserConfig,
        verifier: &'a dyn SignatureVerifier,
    ) -> Result<&'b mut Self, ContextTooSmall> {
        let too_small = ContextTooSmall {
            required: context_size(),
            provided: buffer.len(),
        };
        let offset = buffer.as_ptr().align_offset(mem::align_of::<Self>());
        if offset == usize::MAX || buffer.len() < offset.saturating_add(mem::size_of::<Self>()) {
            return Err(too_small);
        }
        let slot = buffer[offset..].as_mut_ptr().cast::<Self>();
        // SAFETY: `slot` is aligned for `Self`, has room for it, and is
        // exclusively borrowed for 'b through `buffer`.
        unsafe {
            slot.write(Self::new(config, verifier));
            Ok(&mut *slot)
        }
    }

    /// Recovers a context placed by [`ParserContext::init_in`] at the start
    /// of `buffer`. Returns `None` if no context was initialized there.
    ///
    /// # Safety
    /// `buffer` must point to at least [`context_size`] bytes that were
    /// passed to `init_in`, or that are at least readable, and no other
    /// reference to the context may be alive.
    pub unsafe fn from_raw<'b>(buffer: *mut u8) -> Option<&'b mut Self> {
        let offset = buffer.align_offset(mem::align_of::<Self>());
        if offset == usize::MAX {
            return None;
        }
        let context = buffer.add(offset).cast::<Self>();
        let magic = core::ptr::addr_of!((*context).magic).read_volatile();
        if magic != CONTEXT_MAGIC {
            return None;
        }
        Some(&mut *context)
    }

    pub fn properties(&self) -> &ImageProperties {
        &self.properties
    }

    /// Feeds the next chunk of the image.
    ///
    /// After `Success` or `Failed` further calls return the same outcome
    /// without consuming data.
    pub fn parse_buffer(
        &mut self,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> ParseOutcome {
        let mut input = Input { data, offset: 0 };
        if let Err(e) = self.run(&mut input, callbacks) {
            self.state = State::Error(e);
        }
        self.outcome()
    }

    /// Extracts the application descriptor and bootloader version without
    /// delivering any payload.
    pub fn parse_image_info(&mut self, data: &[u8]) -> Result<ImageInfo, ParseError> {
        self.parse_buffer(data, &mut NoCallbacks);
        let found = ImageContents::APPLICATION | ImageContents::BOOTLOADER;
        if !self.properties.contents.intersects(found) {
            return Err(ParseError::NoImage);
        }
        Ok(ImageInfo {
            application: self.properties.application,
            bootloader_version: self.properties.bootloader_version,
        })
    }

    fn outcome(&self) -> ParseOutcome {
        match self.state {
            State::Done if self.properties.image_verified => ParseOutcome::Success,
            State::Done => ParseOutcome::Failed(ParseError::Signature),
            State::Error(e) => ParseOutcome::Failed(e),
            _ => ParseOutcome::Continue,
        }
    }

    fn run(
        &mut self,
        input: &mut Input<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParseError> {
        while input.remaining() > 0 {
            let step = match self.state {
                State::Done | State::Error(_) => return Ok(()),
                State::Init => self.parse_version(input)?,
                State::Header => self.parse_header(input)?,
                State::Idle => self.parse_tag(input)?,
                State::EncryptionInit => self.parse_encryption_init(input)?,
                State::EncryptionContainer => {
                    self.in_encrypted_container = true;
                    self.state = State::Idle;
                    Step::Parsed
                }
                State::Application => self.parse_application(input)?,
                State::Bootloader => self.parse_bootloader(input)?,
                State::Prog => self.parse_prog(input)?,
                State::Metadata => {
                    self.address = 0;
                    self.properties.contents |= ImageContents::METADATA;
                    self.state = State::MetadataData;
                    Step::Parsed
                }
                State::BootloaderData | State::ProgData | State::MetadataData => {
                    self.parse_data(input, callbacks)?
                }
                State::Signature => self.parse_signature(input)?,
                State::Finalize => self.finalize(input, callbacks)?,
            };
            if let Step::NeedMore = step {
                break;
            }
        }
        Ok(())
    }

    fn available(&self, input: &Input<'_>) -> usize {
        self.carry.len() + input.remaining()
    }

    /// Moves the rest of `input` into the carry-over buffer.
    fn store(&mut self, input: &mut Input<'_>) -> Result<(), ParseError> {
        for &byte in &input.data[input.offset..] {
            self.carry.push_back(byte).map_err(|_| ParseError::Buffer)?;
        }
        input.offset = input.data.len();
        Ok(())
    }

    fn take(&mut self, input: &mut Input<'_>, out: &mut [u8]) {
        for byte in out.iter_mut() {
            *byte = match self.carry.pop_front() {
                Some(b) => b,
                None => {
                    let b = input.data[input.offset];
                    input.offset += 1;
                    b
                }
            };
        }
    }

    fn advance(&mut self, len: u32) {
        self.tag_offset += len;
        if self.in_encrypted_container {
            self.encrypted_offset += len;
            if self.encrypted_offset >= self.encrypted_length {
                self.in_encrypted_container = false;
            }
        }
    }

    /// Fills `out` from carry-over and input, or stashes what is there and
    /// asks for more. Every byte goes through the CRC.
    fn get_data(
        &mut self,
        input: &mut Input<'_>,
        out: &mut [u8],
        apply: Apply,
    ) -> Result<Step, ParseError> {
        if self.available(input) < out.len() {
            self.store(input)?;
            return Ok(Step::NeedMore);
        }
        self.take(input, out);
        self.crc.update(out);
        if apply.contains(Apply::SHA) {
            self.sha.update(&*out);
        }
        if apply.contains(Apply::DECRYPT) && self.in_encrypted_container {
            if let Some(decryptor) = self.decryptor.as_deref_mut() {
                decryptor.apply(out);
            }
        }
        self.advance(out.len() as u32);
        Ok(Step::Parsed)
    }

    fn read_tag_header(&mut self, input: &mut Input<'_>) -> Result<Option<TagHeader>, ParseError> {
        let in_container = self.in_encrypted_container;
        let mut raw = [0u8; TAG_HEADER_SIZE];
        if let Step::NeedMore = self.get_data(input, &mut raw, Apply::empty())? {
            return Ok(None);
        }
        if in_container {
            // Hash covers the ciphertext.
            self.sha.update(raw);
            if let Some(decryptor) = self.decryptor.as_deref_mut() {
                decryptor.apply(&mut raw);
            }
        }
        let tag = TagHeader {
            id: le32(&raw, 0),
            length: le32(&raw, 4),
        };
        if !in_container && tag.id != TAG_SIGNATURE_ECDSA_P256 && tag.id != TAG_END {
            self.sha.update(raw);
        }
        self.tag_length = tag.length;
        self.tag_offset = 0;
        Ok(Some(tag))
    }

    fn parse_version(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        let Some(tag) = self.read_tag_header(input)? else {
            return Ok(Step::NeedMore);
        };
        if tag.id != TAG_HEADER_V3 || tag.length != HEADER_PAYLOAD_SIZE {
            return Err(ParseError::Unexpected);
        }
        self.state = State::Header;
        Ok(Step::Parsed)
    }

    fn parse_header(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        let mut raw = [0u8; HEADER_PAYLOAD_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut raw, Apply::SHA)? {
            return Ok(Step::NeedMore);
        }
        let version = le32(&raw, 0);
        let image_type = le32(&raw, 4);
        if version & VERSION_MAJOR_MASK != VERSION_MAJOR {
            return Err(ParseError::Version);
        }
        if image_type & TYPE_ENCRYPTION_AESCCM != 0 {
            if self.decryptor.is_none() {
                return Err(ParseError::FileType);
            }
            self.encrypted = true;
        } else if self.config.require_encryption {
            return Err(ParseError::FileType);
        }
        if self.config.require_signature && image_type & TYPE_SIGNATURE_ECDSA == 0 {
            return Err(ParseError::FileType);
        }
        self.state = State::Idle;
        Ok(Step::Parsed)
    }

    fn parse_tag(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        let Some(tag) = self.read_tag_header(input)? else {
            return Ok(Step::NeedMore);
        };

        // Nothing but the end tag may follow a signature.
        if self.signature_checked {
            if tag.id != TAG_END {
                return Err(ParseError::Unexpected);
            }
            self.state = State::Finalize;
            return Ok(Step::Parsed);
        }

        let require_signature = self.config.require_signature;
        self.state = if self.encrypted && !self.in_encrypted_container {
            match tag.id {
                TAG_ENC_INIT => State::EncryptionInit,
                TAG_ENC_GBL_DATA => {
                    self.encrypted_length = tag.length;
                    self.encrypted_offset = 0;
                    State::EncryptionContainer
                }
                TAG_SIGNATURE_ECDSA_P256 => State::Signature,
                TAG_END if !require_signature => State::Finalize,
                TAG_END | TAG_HEADER_V3 | TAG_BOOTLOADER | TAG_APPLICATION | TAG_METADATA
                | TAG_PROG | TAG_ERASEPROG => return Err(ParseError::Unexpected),
                _ => return Err(ParseError::UnknownTag),
            }
        } else {
            match tag.id {
                TAG_APPLICATION => State::Application,
                TAG_BOOTLOADER => State::Bootloader,
                TAG_METADATA => State::Metadata,
                TAG_PROG | TAG_ERASEPROG => State::Prog,
                TAG_END if require_signature || self.in_encrypted_container => {
                    return Err(ParseError::Unexpected)
                }
                TAG_END => State::Finalize,
                TAG_SIGNATURE_ECDSA_P256 if self.in_encrypted_container => {
                    return Err(ParseError::Unexpected)
                }
                TAG_SIGNATURE_ECDSA_P256 => State::Signature,
                TAG_HEADER_V3 | TAG_ENC_INIT | TAG_ENC_GBL_DATA => {
                    return Err(ParseError::Unexpected)
                }
                _ if self.in_encrypted_container => return Err(ParseError::KeyError),
                _ => return Err(ParseError::UnknownTag),
            }
        };
        Ok(Step::Parsed)
    }

    fn parse_encryption_init(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        if self.tag_length != ENC_INIT_SIZE {
            return Err(ParseError::Unexpected);
        }
        let mut raw = [0u8; ENC_INIT_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut raw, Apply::SHA)? {
            return Ok(Step::NeedMore);
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&raw[4..]);
        let Some(decryptor) = self.decryptor.as_deref_mut() else {
            return Err(ParseError::FileType);
        };
        decryptor.start(&nonce);
        self.state = State::Idle;
        Ok(Step::Parsed)
    }

    fn parse_application(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        let len = self.tag_length as usize;
        if !(ApplicationData::SIZE..=CHUNK_SIZE).contains(&len) {
            return Err(ParseError::Unexpected);
        }
        let mut raw = [0u8; CHUNK_SIZE];
        if let Step::NeedMore = self.get_data(input, &mut raw[..len], Apply::SHA | Apply::DECRYPT)? {
            return Ok(Step::NeedMore);
        }
        let app = ApplicationData::from_le_bytes(&raw[..len]).ok_or(ParseError::Unexpected)?;
        if let Some(minimum) = self.config.minimum_application_version {
            if app.version < minimum {
                return Err(ParseError::Rejected);
            }
        }
        self.properties.application = app;
        self.properties.contents |= ImageContents::APPLICATION;
        self.state = State::Idle;
        Ok(Step::Parsed)
    }

    fn parse_bootloader(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        if self.tag_length < BOOTLOADER_HEADER_SIZE {
            return Err(ParseError::Unexpected);
        }
        let mut raw = [0u8; BOOTLOADER_HEADER_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut raw, Apply::SHA | Apply::DECRYPT)? {
            return Ok(Step::NeedMore);
        }
        if le32(&raw, 4) != self.config.bootloader_base {
            return Err(ParseError::Unexpected);
        }
        self.properties.bootloader_version = le32(&raw, 0);
        self.properties.bootloader_upgrade_size = self.tag_length - BOOTLOADER_HEADER_SIZE;
        self.properties.contents |= ImageContents::BOOTLOADER;
        self.received_bootloader = true;
        self.address = 0;
        self.state = State::BootloaderData;
        Ok(Step::Parsed)
    }

    fn parse_prog(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        if self.tag_length < PROG_ADDRESS_SIZE {
            return Err(ParseError::Unexpected);
        }
        let mut raw = [0u8; PROG_ADDRESS_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut raw, Apply::SHA | Apply::DECRYPT)? {
            return Ok(Step::NeedMore);
        }
        self.address = le32(&raw, 0);
        self.state = State::ProgData;
        Ok(Step::Parsed)
    }

    /// Streams the payload of a prog, bootloader or metadata tag in
    /// word-multiple chunks.
    fn parse_data(
        &mut self,
        input: &mut Input<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<Step, ParseError> {
        let mut chunk = [0u8; CHUNK_SIZE];
        while self.tag_offset < self.tag_length {
            let left = (self.tag_length - self.tag_offset) as usize;
            let mut len = left.min(CHUNK_SIZE).min(self.available(input));
            if len < left.min(4) {
                self.store(input)?;
                return Ok(Step::NeedMore);
            }
            if len >= 4 {
                len &= !3;
            }
            if let Step::NeedMore =
                self.get_data(input, &mut chunk[..len], Apply::SHA | Apply::DECRYPT)?
            {
                return Ok(Step::NeedMore);
            }
            match self.state {
                State::MetadataData => {
                    callbacks.metadata(self.address, &chunk[..len])?;
                    self.address += len as u32;
                }
                State::ProgData => {
                    let len = pad_to_word(&mut chunk, len);
                    self.program(&mut chunk[..len], callbacks)?;
                }
                _ => {
                    let len = pad_to_word(&mut chunk, len);
                    self.program_bootloader(&mut chunk[..len], callbacks)?;
                }
            }
        }
        self.state = State::Idle;
        Ok(Step::Parsed)
    }

    /// Delivers application data, holding back the vectors that would make
    /// a partially written image bootable.
    fn program(
        &mut self,
        data: &mut [u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParseError> {
        let start = self.address;
        let end = start.saturating_add(data.len() as u32);
        self.address = end;
        if !callbacks.accepts_application() {
            return Ok(());
        }
        if let Some(minimum) = self.config.minimum_application_version {
            let declared = self.properties.contents.contains(ImageContents::APPLICATION);
            if !declared || self.properties.application.version < minimum {
                return Err(ParseError::Rejected);
            }
        }

        let pc = self.config.application_start + 4;
        let held_start = start.max(pc);
        let held_end = end.min(pc + WITHHELD_APPLICATION_VECTORS as u32);
        if held_start < held_end {
            let src = (held_start - start) as usize..(held_end - start) as usize;
            let dst = (held_start - pc) as usize..(held_end - pc) as usize;
            self.withheld_application[dst].copy_from_slice(&data[src.clone()]);
            data[src].fill(0xFF);
        }

        if let Some(location) = self.config.bootloader_upgrade_location {
            let upgrade_pc = location + 4;
            if start <= upgrade_pc && end >= upgrade_pc + 4 {
                let at = (upgrade_pc - start) as usize;
                self.withheld_upgrade.copy_from_slice(&data[at..at + 4]);
                data[at..at + 4].fill(0xFF);
            }
        }

        callbacks.application_data(start, data)?;
        self.programmed = true;
        Ok(())
    }

    fn program_bootloader(
        &mut self,
        data: &mut [u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParseError> {
        let start = self.address;
        if start <= 4 && start as usize + data.len() >= 8 {
            let at = (4 - start) as usize;
            self.withheld_bootloader.copy_from_slice(&data[at..at + 4]);
            data[at..at + 4].fill(0xFF);
        }
        callbacks.bootloader_data(start, data)?;
        self.address += data.len() as u32;
        Ok(())
    }

    fn parse_signature(&mut self, input: &mut Input<'_>) -> Result<Step, ParseError> {
        if self.tag_length != SIGNATURE_SIZE {
            return Err(ParseError::Unexpected);
        }
        let mut signature = [0u8; SIGNATURE_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut signature, Apply::empty())? {
            return Ok(Step::NeedMore);
        }
        let hash = mem::take(&mut self.sha).finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hash);
        if !self
            .verifier
            .verify(&self.config.public_key, &digest, &signature)
        {
            return Err(ParseError::Signature);
        }
        self.signature_checked = true;
        self.state = State::Idle;
        Ok(Step::Parsed)
    }

    fn finalize(
        &mut self,
        input: &mut Input<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<Step, ParseError> {
        if self.tag_length != END_SIZE {
            return Err(ParseError::Unexpected);
        }
        let mut crc = [0u8; END_SIZE as usize];
        if let Step::NeedMore = self.get_data(input, &mut crc, Apply::empty())? {
            return Ok(Step::NeedMore);
        }
        let residue = mem::replace(&mut self.crc, CRC32.digest()).finalize();
        if residue != CRC32_RESIDUE {
            return Err(ParseError::Crc);
        }

        let verified = self.signature_checked || !self.config.require_signature;
        if verified {
            self.release_withheld(callbacks)?;
        }
        self.properties.image_completed = true;
        self.properties.image_verified = verified;
        self.state = State::Done;
        Ok(Step::Parsed)
    }

    /// Writes the held-back vectors, program counter last.
    fn release_withheld(&mut self, callbacks: &mut dyn ParserCallbacks) -> Result<(), ParseError> {
        let erased = [0xFFu8; 4];
        if self.received_bootloader && self.withheld_bootloader != erased {
            let vector = self.withheld_bootloader;
            callbacks.bootloader_data(4, &vector)?;
        }
        if !self.programmed {
            return Ok(());
        }
        if let Some(location) = self.config.bootloader_upgrade_location {
            if self.withheld_upgrade != erased {
                let vector = self.withheld_upgrade;
                callbacks.application_data(location + 4, &vector)?;
            }
        }
        if self.withheld_application[..4] != erased {
            let pc = self.config.application_start + 4;
            let vectors = self.withheld_application;
            callbacks.application_data(pc + 4, &vectors[4..])?;
            callbacks.application_data(pc, &vectors[..4])?;
        }
        Ok(())
    }
}
