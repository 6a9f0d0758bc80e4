use userserver_core::PrincipalId;

/// Principal context for a request.
///
/// Anonymous when the request carried no bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrincipalContext {
    principal_id: Option<PrincipalId>,
}

impl PrincipalContext {
    pub fn authenticated(principal_id: PrincipalId) -> Self {
        Self {
            principal_id: Some(principal_id),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn principal_id(&self) -> Option<&PrincipalId> {
        self.principal_id.as_ref()
    }
}
