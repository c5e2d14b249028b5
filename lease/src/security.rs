use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityProvider {
    None,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtectionLevel {
    None,
    Sign,
    EncryptAndSign,
}

/// blake3 digest identifying a certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Thumbprint([u8; 32]);

impl Thumbprint {
    pub fn of(certificate: &[u8]) -> Self {
        Self(*blake3::hash(certificate).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({})", self)
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Transport security for lease traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub provider: SecurityProvider,
    pub protection: ProtectionLevel,
    /// DER bytes of the local certificate.
    pub certificate: Vec<u8>,
    /// Remote subject names accepted during the handshake.
    pub allowed_remote_names: Vec<String>,
}

impl SecuritySettings {
    pub fn unsecured() -> Self {
        Self {
            provider: SecurityProvider::None,
            protection: ProtectionLevel::None,
            certificate: Vec::new(),
            allowed_remote_names: Vec::new(),
        }
    }

    pub fn x509(certificate: impl Into<Vec<u8>>, protection: ProtectionLevel) -> Self {
        Self {
            provider: SecurityProvider::X509,
            protection,
            certificate: certificate.into(),
            allowed_remote_names: Vec::new(),
        }
    }

    pub fn with_remote_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_remote_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_secure(&self) -> bool {
        self.provider != SecurityProvider::None
    }

    pub fn validate(&self) -> Result<()> {
        match self.provider {
            SecurityProvider::None if self.protection != ProtectionLevel::None => Err(Error::InvalidSecurity(
                "protection requires a security provider".to_string(),
            )),
            SecurityProvider::X509 if self.certificate.is_empty() => {
                Err(Error::InvalidSecurity("x509 provider requires a certificate".to_string()))
            }
            SecurityProvider::X509 if self.protection == ProtectionLevel::None => Err(Error::InvalidSecurity(
                "x509 provider requires a protection level".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Checks that moving from `self` to `next` never weakens the provider
    /// or the protection level. Rotating credentials at the same level is
    /// allowed.
    pub fn can_upgrade_to(&self, next: &SecuritySettings) -> Result<()> {
        if next.provider < self.provider {
            return Err(Error::SecurityDowngrade {
                reason: format!("provider {:?} -> {:?}", self.provider, next.provider),
            });
        }
        if next.protection < self.protection {
            return Err(Error::SecurityDowngrade {
                reason: format!("protection {:?} -> {:?}", self.protection, next.protection),
            });
        }
        Ok(())
    }

    /// What the lease driver needs to secure its channels.
    pub fn material(&self) -> SecurityMaterial {
        SecurityMaterial {
            provider: self.provider,
            protection: self.protection,
            thumbprint: self.is_secure().then(|| Thumbprint::of(&self.certificate)),
            allowed_remote_names: self.allowed_remote_names.clone(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self::unsecured()
    }
}

/// Credential material handed to the lease driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMaterial {
    pub provider: SecurityProvider,
    pub protection: ProtectionLevel,
    pub thumbprint: Option<Thumbprint>,
    pub allowed_remote_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_rules() {
        let open = SecuritySettings::unsecured();
        let signed = SecuritySettings::x509(b"cert-a".to_vec(), ProtectionLevel::Sign);
        let encrypted = SecuritySettings::x509(b"cert-a".to_vec(), ProtectionLevel::EncryptAndSign);
        let rotated = SecuritySettings::x509(b"cert-b".to_vec(), ProtectionLevel::EncryptAndSign);

        assert!(open.can_upgrade_to(&signed).is_ok());
        assert!(signed.can_upgrade_to(&encrypted).is_ok());
        assert!(encrypted.can_upgrade_to(&rotated).is_ok());

        assert!(matches!(
            encrypted.can_upgrade_to(&signed),
            Err(Error::SecurityDowngrade { .. })
        ));
        assert!(matches!(signed.can_upgrade_to(&open), Err(Error::SecurityDowngrade { .. })));
    }

    #[test]
    fn test_validate() {
        assert!(SecuritySettings::unsecured().validate().is_ok());
        assert!(SecuritySettings::x509(Vec::new(), ProtectionLevel::Sign).validate().is_err());
        assert!(SecuritySettings::x509(b"c".to_vec(), ProtectionLevel::None).validate().is_err());
    }

    #[test]
    fn test_material_thumbprint() {
        let settings = SecuritySettings::x509(b"cert".to_vec(), ProtectionLevel::Sign).with_remote_names(["node-b"]);
        let material = settings.material();

        assert_eq!(material.thumbprint, Some(Thumbprint::of(b"cert")));
        assert_ne!(Thumbprint::of(b"cert"), Thumbprint::of(b"cert2"));
        assert_eq!(material.allowed_remote_names, vec!["node-b".to_string()]);
        assert_eq!(SecuritySettings::unsecured().material().thumbprint, None);
    }
}
