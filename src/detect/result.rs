use serde::Serialize;

/// Bounding box in normalized 0..1 coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One detection returned by the inference collaborator. Ephemeral: never
/// persisted by this crate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub label: String,
}
