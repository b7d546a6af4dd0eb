use crate::error::Error;
use crate::store::CacheStore;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const KEY: &str = "key";
const VALUE: &str = "value";
const COUNT: &str = "count";
const EXPIRES_AT: &str = "expiresAt";

/// DynamoDB-backed [`CacheStore`].
///
/// The table needs a string hash key named `key`. `expiresAt` holds epoch
/// seconds and should be configured as the table's TTL attribute; since
/// DynamoDB deletes expired items lazily, every read and conditional write
/// also compares it against the current time.
pub struct DynamoDbStore {
    client: Client,
    table_name: String,
}

impl DynamoDbStore {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn epoch_secs(at: SystemTime) -> Result<i64, Error> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Internal(e.to_string()))?
        .as_secs();
    i64::try_from(secs).map_err(|e| Error::Internal(e.to_string()))
}

fn expiry_attr(now: SystemTime, ttl: Duration) -> Result<AttributeValue, Error> {
    Ok(AttributeValue::N(epoch_secs(now + ttl)?.to_string()))
}

fn number_attr(
    attributes: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<Option<i64>, Error> {
    match attributes.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_n()
            .ok()
            .and_then(|n| n.parse::<i64>().ok())
            .map(Some)
            .ok_or_else(|| Error::Decoding(format!("Invalid '{name}' field"))),
    }
}

fn is_live(attributes: &HashMap<String, AttributeValue>, now_secs: i64) -> Result<bool, Error> {
    Ok(number_attr(attributes, EXPIRES_AT)?.map_or(true, |expires_at| expires_at > now_secs))
}

#[async_trait]
impl CacheStore for DynamoDbStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let now_secs = epoch_secs(SystemTime::now())?;

        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::DynamoDb(e.to_string()))?;

        let Some(attributes) = result.item else {
            return Ok(None);
        };
        if !is_live(&attributes, now_secs)? {
            return Ok(None);
        }

        if let Some(value) = attributes.get(VALUE) {
            let value = value
                .as_s()
                .map_err(|_| Error::Decoding(format!("Invalid '{VALUE}' field")))?;
            return Ok(Some(value.clone()));
        }

        Ok(number_attr(&attributes, COUNT)?.map(|count| count.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY, AttributeValue::S(key.to_string()))
            .item(VALUE, AttributeValue::S(value.to_string()));

        if let Some(ttl) = ttl {
            request = request.item(EXPIRES_AT, expiry_attr(SystemTime::now(), ttl)?);
        }

        request
            .send()
            .await
            .map_err(|e| Error::DynamoDb(e.to_string()))?;

        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let now = SystemTime::now();

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY, AttributeValue::S(key.to_string()))
            .item(VALUE, AttributeValue::S(value.to_string()))
            .condition_expression("attribute_not_exists(#k) OR #exp <= :now")
            .expression_attribute_names("#k", KEY)
            .expression_attribute_names("#exp", EXPIRES_AT)
            .expression_attribute_values(":now", AttributeValue::N(epoch_secs(now)?.to_string()));

        if let Some(ttl) = ttl {
            request = request.item(EXPIRES_AT, expiry_attr(now, ttl)?);
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(Error::DynamoDb(err.to_string())),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let now = SystemTime::now();

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY, AttributeValue::S(key.to_string()))
            .item(VALUE, AttributeValue::S(value.to_string()))
            .condition_expression("#v = :expected AND (attribute_not_exists(#exp) OR #exp > :now)")
            .expression_attribute_names("#v", VALUE)
            .expression_attribute_names("#exp", EXPIRES_AT)
            .expression_attribute_values(":expected", AttributeValue::S(expected.to_string()))
            .expression_attribute_values(":now", AttributeValue::N(epoch_secs(now)?.to_string()));

        if let Some(ttl) = ttl {
            request = request.item(EXPIRES_AT, expiry_attr(now, ttl)?);
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(Error::DynamoDb(err.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = SystemTime::now();

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::S(key.to_string()))
            .update_expression("SET #exp = :exp")
            .condition_expression("attribute_exists(#k) AND (attribute_not_exists(#exp) OR #exp > :now)")
            .expression_attribute_names("#k", KEY)
            .expression_attribute_names("#exp", EXPIRES_AT)
            .expression_attribute_values(":exp", expiry_attr(now, ttl)?)
            .expression_attribute_values(":now", AttributeValue::N(epoch_secs(now)?.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(Error::DynamoDb(err.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| Error::DynamoDb(e.to_string()))?;

        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let now = SystemTime::now();

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::S(key.to_string()))
            .update_expression("SET #exp = if_not_exists(#exp, :exp) ADD #c :one")
            .condition_expression("attribute_not_exists(#k) OR #exp > :now")
            .expression_attribute_names("#k", KEY)
            .expression_attribute_names("#c", COUNT)
            .expression_attribute_names("#exp", EXPIRES_AT)
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .expression_attribute_values(":exp", expiry_attr(now, ttl)?)
            .expression_attribute_values(":now", AttributeValue::N(epoch_secs(now)?.to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;

        match result {
            Ok(output) => {
                let attributes = output.attributes.unwrap_or_default();
                let count = number_attr(&attributes, COUNT)?
                    .ok_or_else(|| Error::Decoding(format!("Missing '{COUNT}' field")))?;
                u64::try_from(count).map_err(|e| Error::Decoding(e.to_string()))
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                // The previous window's item has expired but not been reaped yet
                self.client
                    .put_item()
                    .table_name(&self.table_name)
                    .item(KEY, AttributeValue::S(key.to_string()))
                    .item(COUNT, AttributeValue::N("1".to_string()))
                    .item(EXPIRES_AT, expiry_attr(now, ttl)?)
                    .send()
                    .await
                    .map_err(|e| Error::DynamoDb(e.to_string()))?;
                Ok(1)
            }
            Err(err) => Err(Error::DynamoDb(err.to_string())),
        }
    }
}
