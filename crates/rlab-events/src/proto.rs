//! The subset of tensorboard's `event.proto` / `summary.proto` / `tensor.proto`
//! needed to pull scalars out of an event file. Unlisted fields (graph defs,
//! histograms, images, ...) are skipped by the decoder.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Event {
    #[prost(double, tag = "1")]
    pub wall_time: f64,
    #[prost(int64, tag = "2")]
    pub step: i64,
    #[prost(string, tag = "3")]
    pub file_version: String,
    #[prost(message, optional, tag = "5")]
    pub summary: Option<Summary>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Summary {
    #[prost(message, repeated, tag = "1")]
    pub value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SummaryValue {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(float, optional, tag = "2")]
    pub simple_value: Option<f32>,
    #[prost(string, tag = "7")]
    pub node_name: String,
    #[prost(message, optional, tag = "8")]
    pub tensor: Option<TensorProto>,
    #[prost(message, optional, tag = "9")]
    pub metadata: Option<SummaryMetadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SummaryMetadata {
    #[prost(message, optional, tag = "1")]
    pub plugin_data: Option<PluginData>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PluginData {
    #[prost(string, tag = "1")]
    pub plugin_name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub content: Vec<u8>,
}

pub const DT_FLOAT: i32 = 1;
pub const DT_DOUBLE: i32 = 2;
pub const DT_INT32: i32 = 3;
pub const DT_INT64: i32 = 9;

#[derive(Clone, PartialEq, prost::Message)]
pub struct TensorProto {
    #[prost(int32, tag = "1")]
    pub dtype: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub tensor_content: Vec<u8>,
    #[prost(float, repeated, tag = "5")]
    pub float_val: Vec<f32>,
    #[prost(double, repeated, tag = "6")]
    pub double_val: Vec<f64>,
    #[prost(int32, repeated, tag = "7")]
    pub int_val: Vec<i32>,
    #[prost(int64, repeated, tag = "10")]
    pub int64_val: Vec<i64>,
}

impl SummaryValue {
    /// The scalar carried by this value, if it is one.
    pub fn scalar(&self) -> Option<f64> {
        if let Some(v) = self.simple_value {
            return Some(f64::from(v));
        }
        let plugin = self
            .metadata
            .as_ref()
            .and_then(|m| m.plugin_data.as_ref())
            .map(|p| p.plugin_name.as_str());
        if matches!(plugin, Some(name) if !name.is_empty() && name != "scalars") {
            return None;
        }
        self.tensor.as_ref().and_then(TensorProto::single_value)
    }
}

impl TensorProto {
    fn single_value(&self) -> Option<f64> {
        match (
            self.float_val.as_slice(),
            self.double_val.as_slice(),
            self.int_val.as_slice(),
            self.int64_val.as_slice(),
        ) {
            ([v], [], [], []) => return Some(f64::from(*v)),
            ([], [v], [], []) => return Some(*v),
            ([], [], [v], []) => return Some(f64::from(*v)),
            ([], [], [], [v]) => return Some(*v as f64),
            _ => {}
        }
        let bytes = self.tensor_content.as_slice();
        match (self.dtype, bytes.len()) {
            (DT_FLOAT, 4) => Some(f64::from(f32::from_le_bytes(bytes.try_into().ok()?))),
            (DT_DOUBLE, 8) => Some(f64::from_le_bytes(bytes.try_into().ok()?)),
            (DT_INT32, 4) => Some(f64::from(i32::from_le_bytes(bytes.try_into().ok()?))),
            (DT_INT64, 8) => Some(i64::from_le_bytes(bytes.try_into().ok()?) as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn value_with_tensor(tensor: TensorProto, plugin: Option<&str>) -> SummaryValue {
        SummaryValue {
            tag: "reward".to_string(),
            tensor: Some(tensor),
            metadata: plugin.map(|name| SummaryMetadata {
                plugin_data: Some(PluginData {
                    plugin_name: name.to_string(),
                    content: Vec::new(),
                }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn simple_value_wins_over_tensor() {
        let value = SummaryValue {
            tag: "a".to_string(),
            simple_value: Some(0.5),
            ..Default::default()
        };
        assert_eq!(value.scalar(), Some(0.5));
    }

    #[test]
    fn scalar_plugin_tensor_is_read_from_content_bytes() {
        let tensor = TensorProto {
            dtype: DT_DOUBLE,
            tensor_content: 2.25f64.to_le_bytes().to_vec(),
            ..Default::default()
        };
        let value = value_with_tensor(tensor, Some("scalars"));
        assert_eq!(value.scalar(), Some(2.25));
    }

    #[test]
    fn other_plugin_tensors_are_not_scalars() {
        let tensor = TensorProto {
            dtype: DT_FLOAT,
            float_val: vec![1.0],
            ..Default::default()
        };
        let value = value_with_tensor(tensor, Some("text"));
        assert_eq!(value.scalar(), None);
    }

    #[test]
    fn multi_element_tensor_is_rejected() {
        let tensor = TensorProto {
            dtype: DT_FLOAT,
            float_val: vec![1.0, 2.0],
            ..Default::default()
        };
        assert_eq!(value_with_tensor(tensor, None).scalar(), None);
    }

    #[test]
    fn event_survives_wire_encoding() {
        let event = Event {
            wall_time: 1.0,
            step: 7,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: "consecutive_successes".to_string(),
                    simple_value: Some(3.0),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        };
        let decoded = Event::decode(event.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(decoded.step, 7);
        assert_eq!(decoded.summary.expect("summary").value[0].scalar(), Some(3.0));
    }
}
