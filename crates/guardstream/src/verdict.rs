/// Outcome of classifying one request's prompt.
///
/// A harm category only exists for unsafe prompts, so the type carries it in
/// the [`SafetyVerdict::Unsafe`] variant instead of next to a boolean.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe { harm_category: String },
}

impl SafetyVerdict {
    pub fn unsafe_with(harm_category: impl Into<String>) -> Self {
        Self::Unsafe {
            harm_category: harm_category.into(),
        }
    }

    pub const fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }

    /// Returns the harm category for unsafe verdicts.
    pub fn harm_category(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Unsafe { harm_category } => Some(harm_category),
        }
    }
}
