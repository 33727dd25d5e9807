use crate::error::{MqttError, Result};

/// MQTT 3.1 caps client identifiers at 23 characters.
pub const MAX_CLIENT_ID_LEN: usize = 23;

const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_client_id(client_id: &str) -> Result<()> {
    if client_id.is_empty() {
        return Err(MqttError::InvalidClientId(
            "client identifier must not be empty".to_string(),
        ));
    }
    let chars = client_id.chars().count();
    if chars > MAX_CLIENT_ID_LEN {
        return Err(MqttError::InvalidClientId(format!(
            "{client_id} is {chars} characters, maximum is {MAX_CLIENT_ID_LEN}"
        )));
    }
    Ok(())
}

pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MqttError::InvalidTopicName("empty topic".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(MqttError::InvalidTopicName(format!(
            "topic is {} bytes",
            topic.len()
        )));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(MqttError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(MqttError::InvalidTopicFilter(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let is_last = index == levels.len() - 1;
        match *level {
            "#" if !is_last => {
                return Err(MqttError::InvalidTopicFilter(format!(
                    "{filter}: '#' must be the last level"
                )));
            }
            "#" | "+" => {}
            other if other.contains(['+', '#']) => {
                return Err(MqttError::InvalidTopicFilter(format!(
                    "{filter}: wildcard must occupy a whole level"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_length() {
        assert!(validate_client_id("a").is_ok());
        assert!(validate_client_id(&"x".repeat(23)).is_ok());
        assert!(validate_client_id(&"x".repeat(24)).is_err());
        assert!(validate_client_id("").is_err());
    }

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("sensors/kitchen/temp").is_ok());
        assert!(validate_topic_name("/leading").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
        assert!(validate_topic_name("a/#").is_err());
    }

    #[test]
    fn test_topic_filters() {
        assert!(validate_topic_filter("sensors/+/temp").is_ok());
        assert!(validate_topic_filter("sensors/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("sensors/#/temp").is_err());
        assert!(validate_topic_filter("sensors/te+").is_err());
        assert!(validate_topic_filter("").is_err());
    }
}
