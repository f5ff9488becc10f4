//! Current-user identity

use parking_lot::RwLock;

/// The signed-in user as seen by the session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }
}

/// Supplies the current user; `None` means nobody is signed in
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<Identity>;
}

/// Identity that can be swapped as the user signs in and out
#[derive(Debug, Default)]
pub struct SharedIdentity {
    current: RwLock<Option<Identity>>,
}

impl SharedIdentity {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            current: RwLock::new(Some(identity)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: Option<Identity>) {
        *self.current.write() = identity;
    }
}

impl IdentityProvider for SharedIdentity {
    fn current(&self) -> Option<Identity> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let identity = SharedIdentity::anonymous();
        assert!(identity.current().is_none());

        identity.set(Some(Identity::new("u1", "Ada")));
        assert_eq!(identity.current().map(|i| i.display_name), Some("Ada".to_string()));

        identity.set(None);
        assert!(identity.current().is_none());
    }
}
