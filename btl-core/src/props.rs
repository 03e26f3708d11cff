//! Application properties block embedded in application images.
//!
//! The block is located through vector table word 13, a slot the Cortex-M
//! architecture leaves reserved. All fields are little endian.

/// Vector table offset of the pointer to [`ApplicationProperties`].
pub const PROPERTIES_POINTER_OFFSET: u32 = 13 * 4;

pub const PROPERTIES_MAGIC: [u8; 16] = [
    0x13, 0xb7, 0x79, 0xfa, 0xc9, 0x25, 0xdd, 0xb7, 0xad, 0xf3, 0xcf, 0xe0, 0xf1, 0xb6, 0x14, 0xb8,
];

pub const SIGNATURE_NONE: u32 = 0;
pub const SIGNATURE_ECDSA_P256: u32 = 1 << 0;
pub const SIGNATURE_CRC32: u32 = 1 << 1;

fn le32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Application descriptor carried both in the properties block and in the
/// GBL application tag.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApplicationData {
    pub app_type: u32,
    pub version: u32,
    pub capabilities: u32,
    pub product_id: [u8; 16],
}

impl ApplicationData {
    pub const SIZE: usize = 28;

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut product_id = [0u8; 16];
        product_id.copy_from_slice(&bytes[12..28]);
        Some(Self {
            app_type: le32(bytes, 0),
            version: le32(bytes, 4),
            capabilities: le32(bytes, 8),
            product_id,
        })
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.app_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.capabilities.to_le_bytes());
        out[12..28].copy_from_slice(&self.product_id);
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationProperties {
    pub struct_version: u32,
    pub signature_type: u32,
    /// Offset of the signature from the application base.
    pub signature_location: u32,
    pub app: ApplicationData,
    /// Address of an [`ApplicationCertificate`], zero if absent.
    pub certificate: u32,
    pub long_token_section_address: u32,
    pub decrypt_key: [u8; 16],
}

impl ApplicationProperties {
    pub const SIZE: usize = 80;

    /// Parses the block, returning `None` if the magic does not match.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE || bytes[..16] != PROPERTIES_MAGIC {
            return None;
        }
        let mut decrypt_key = [0u8; 16];
        decrypt_key.copy_from_slice(&bytes[64..80]);
        Some(Self {
            struct_version: le32(bytes, 16),
            signature_type: le32(bytes, 20),
            signature_location: le32(bytes, 24),
            app: ApplicationData::from_le_bytes(&bytes[28..56])?,
            certificate: le32(bytes, 56),
            long_token_section_address: le32(bytes, 60),
            decrypt_key,
        })
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..16].copy_from_slice(&PROPERTIES_MAGIC);
        out[16..20].copy_from_slice(&self.struct_version.to_le_bytes());
        out[20..24].copy_from_slice(&self.signature_type.to_le_bytes());
        out[24..28].copy_from_slice(&self.signature_location.to_le_bytes());
        out[28..56].copy_from_slice(&self.app.to_le_bytes());
        out[56..60].copy_from_slice(&self.certificate.to_le_bytes());
        out[60..64].copy_from_slice(&self.long_token_section_address.to_le_bytes());
        out[64..80].copy_from_slice(&self.decrypt_key);
        out
    }
}

/// Key certificate signed by the bootloader key. The application is then
/// signed with the certified key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationCertificate {
    pub struct_version: u8,
    pub flags: [u8; 3],
    pub key: [u8; 64],
    pub version: u32,
    pub signature: [u8; 64],
}

impl ApplicationCertificate {
    pub const SIZE: usize = 136;
    /// Bytes covered by the certificate signature.
    pub const SIGNED_LEN: usize = 72;

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut flags = [0u8; 3];
        flags.copy_from_slice(&bytes[1..4]);
        let mut key = [0u8; 64];
        key.copy_from_slice(&bytes[4..68]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[72..136]);
        Some(Self {
            struct_version: bytes[0],
            flags,
            key,
            version: le32(bytes, 68),
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_require_magic() {
        let props = ApplicationProperties {
            struct_version: 0x0201,
            signature_type: SIGNATURE_CRC32,
            signature_location: 0x400,
            app: ApplicationData {
                app_type: 1,
                version: 7,
                capabilities: 0,
                product_id: [0xAB; 16],
            },
            certificate: 0,
            long_token_section_address: 0,
            decrypt_key: [0; 16],
        };
        let mut bytes = props.to_le_bytes();
        assert_eq!(ApplicationProperties::from_le_bytes(&bytes), Some(props));

        bytes[3] ^= 0x01;
        assert_eq!(ApplicationProperties::from_le_bytes(&bytes), None);
        assert_eq!(ApplicationProperties::from_le_bytes(&bytes[..40]), None);
    }

    #[test]
    fn certificate_fields() {
        let mut raw = [0u8; ApplicationCertificate::SIZE];
        raw[0] = 1;
        raw[4] = 0x55;
        raw[68..72].copy_from_slice(&3u32.to_le_bytes());
        raw[135] = 0x99;
        let cert = ApplicationCertificate::from_le_bytes(&raw).unwrap();
        assert_eq!(cert.struct_version, 1);
        assert_eq!(cert.key[0], 0x55);
        assert_eq!(cert.version, 3);
        assert_eq!(cert.signature[63], 0x99);
    }
}
