use thiserror::Error;

/// The errors the planning core can run into.
///
/// Degenerate geometry and impossible combing are recovered locally (the
/// offending path is skipped or replaced by a straight travel) and only
/// counted; the remaining kinds abort the layer they occur in.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlannerError {
    ///A closed-loop operation received a polygon with fewer than 3 vertices
    #[error("degenerate geometry: {reason}")]
    GeometryDegenerate { reason: String },

    ///No inside-respecting travel route exists and there is no outside boundary
    #[error("no combing route between the requested points")]
    CombingImpossible,

    ///A computed length does not fit the coordinate type
    #[error("coordinate overflow while {context}")]
    NumericOverflow { context: &'static str },

    ///A setting value outside its declared enumeration, or a missing setting
    #[error("unsupported value {value:?} for setting {key:?}")]
    Unsupported { key: String, value: String },

    ///A post-condition of the plan data model was violated. Always a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl PlannerError {
    ///Whether the error may be recovered locally by dropping the offending
    ///geometry, as opposed to aborting the whole layer.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PlannerError::GeometryDegenerate { .. } | PlannerError::CombingImpossible
        )
    }
}
