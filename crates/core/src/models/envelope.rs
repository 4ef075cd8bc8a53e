use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息通道模式：正常消息或已转入错误通道的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageMode {
    Normal,
    Error,
}

/// 消息信封
///
/// 由接收端产出、处理器消费；转发错误通道时除 id/correlation_id 轮换和
/// mode 翻转外内容保持原样。sequence 是来源内单调递增的位置标记。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub correlation_id: Option<String>,
    pub mode: MessageMode,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(key: String, value: serde_json::Value, sequence: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            value,
            correlation_id: None,
            mode: MessageMode::Normal,
            sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// 转换为错误通道消息：新 id，correlation 指向原消息，mode 翻转
    pub fn into_error_envelope(self) -> Self {
        Self {
            correlation_id: Some(self.id),
            id: Uuid::new_v4().to_string(),
            mode: MessageMode::Error,
            ..self
        }
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = MessageEnvelope::new("order-1".to_string(), json!({"qty": 3}), 42);
        assert!(!envelope.id.is_empty());
        assert_eq!(envelope.mode, MessageMode::Normal);
        assert_eq!(envelope.sequence, 42);
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_error_envelope_rotation() {
        let original = MessageEnvelope::new("order-1".to_string(), json!({"qty": 3}), 42);
        let original_id = original.id.clone();
        let original_value = original.value.clone();

        let error_envelope = original.into_error_envelope();

        assert_ne!(error_envelope.id, original_id);
        assert_eq!(error_envelope.correlation_id, Some(original_id));
        assert_eq!(error_envelope.mode, MessageMode::Error);
        // 载荷与位置信息保持原样
        assert_eq!(error_envelope.value, original_value);
        assert_eq!(error_envelope.sequence, 42);
        assert_eq!(error_envelope.key, "order-1");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = MessageEnvelope::new("k".to_string(), json!({"a": 1}), 7)
            .with_correlation_id("corr-1".to_string());
        let bytes = envelope.serialize_bytes().unwrap();
        let decoded = MessageEnvelope::deserialize_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.correlation_id, Some("corr-1".to_string()));
        assert_eq!(decoded.sequence, 7);
    }
}
