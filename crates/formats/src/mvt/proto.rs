//! Vector tile 2.1 protobuf schema.

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<VectorTileLayer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileLayer {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub features: Vec<VectorTileFeature>,
    #[prost(string, repeated, tag = "3")]
    pub keys: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<VectorTileValue>,
    #[prost(uint32, optional, tag = "5")]
    pub extent: Option<u32>,
    #[prost(uint32, required, tag = "15")]
    pub version: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileFeature {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    /// Alternating key and value indices into the layer tables.
    #[prost(uint32, repeated, tag = "2")]
    pub tags: Vec<u32>,
    #[prost(enumeration = "VectorTileGeomType", optional, tag = "3")]
    pub geometry_type: Option<i32>,
    /// MoveTo/LineTo/ClosePath command integers and zigzag parameters.
    #[prost(uint32, repeated, tag = "4")]
    pub geometry: Vec<u32>,
}

/// Exactly one field is expected to be set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorTileValue {
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub float_value: Option<f32>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "4")]
    pub int_value: Option<i64>,
    #[prost(uint64, optional, tag = "5")]
    pub uint_value: Option<u64>,
    #[prost(sint64, optional, tag = "6")]
    pub sint_value: Option<i64>,
    #[prost(bool, optional, tag = "7")]
    pub bool_value: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum VectorTileGeomType {
    Unknown = 0,
    Point = 1,
    LineString = 2,
    Polygon = 3,
}
