//! [`LeaseStore`] over a single DynamoDB table.
//!
//! Each resource is one item keyed by `container/name`. A lease is the pair
//! `lease_id`/`lease_expires_at` (epoch millis) on the item; every lease
//! transition and metadata write is a conditional `UpdateItem`, so DynamoDB
//! arbitrates races. The table needs a string partition key named `resource`.

use std::{collections::HashMap, convert::TryFrom, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use dynomite::{
    dynamodb::{
        AttributeValue, DynamoDb, DynamoDbClient, GetItemError, GetItemInput, PutItemError,
        PutItemInput, UpdateItemError, UpdateItemInput,
    },
    Attribute, AttributeError, Attributes, FromAttributes, Item,
};
use futures_retry::FutureRetry;
use rusoto_core::{Region, RusotoError};
use tracing::trace;

use crate::{
    config::DynamoConfig,
    error::{Error, Result, StoreError, StoreResult},
    interface::store::{LeaseId, LeaseStore, Metadata, Resource},
    util::retry::FixedCountWithDelayStrategy,
};

#[derive(Item, Debug, Clone, PartialEq)]
struct ResourceItem {
    #[dynomite(partition_key)]
    resource: String,
    metadata: HashMap<String, String>,
    lease_id: Option<String>,
    lease_expires_at: i64,
    lease_duration_millis: i64,
}

pub struct DynamoStore {
    client: DynamoDbClient,
    config: DynamoConfig,
}

impl DynamoStore {
    pub fn new(client: DynamoDbClient, config: DynamoConfig) -> Self {
        Self { client, config }
    }

    pub fn from_config(config: DynamoConfig) -> Result<Self> {
        let region = config
            .region
            .parse::<Region>()
            .map_err(|e| Error::InvalidConfig(format!("region '{}': {}", config.region, e)))?;
        Ok(Self::new(DynamoDbClient::new(region), config))
    }

    async fn with_retry<T, F, Fut>(&self, factory: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Unpin,
        Fut: Future<Output = StoreResult<T>>,
    {
        FutureRetry::new(
            factory,
            FixedCountWithDelayStrategy::new(self.config.max_attempts, self.config.retry_delay),
        )
        .await
        .map(|(value, _attempts)| value)
        .map_err(|(err, _attempts)| err)
    }

    async fn get_item(
        &self,
        resource: &Resource,
        projection: Option<&str>,
    ) -> StoreResult<Option<Attributes>> {
        let input = GetItemInput {
            table_name: self.config.table_name.clone(),
            key: item_key(resource),
            consistent_read: Some(true),
            projection_expression: projection.map(|p| p.to_string()),
            expression_attribute_names: projection.map(|_| names(&[("#r", "resource")])),
            ..GetItemInput::default()
        };
        let client = &self.client;
        let output = self
            .with_retry(move || {
                let input = input.clone();
                async move { client.get_item(input).await.map_err(get_error) }
            })
            .await?;
        Ok(output.item)
    }

    async fn update(
        &self,
        resource: &Resource,
        update_expression: &str,
        condition_expression: &str,
        names: HashMap<String, String>,
        values: HashMap<String, AttributeValue>,
        on_condition_failed: StoreError,
    ) -> StoreResult<()> {
        let input = UpdateItemInput {
            table_name: self.config.table_name.clone(),
            key: item_key(resource),
            update_expression: Some(update_expression.to_string()),
            condition_expression: Some(condition_expression.to_string()),
            expression_attribute_names: Some(names),
            expression_attribute_values: Some(values),
            ..UpdateItemInput::default()
        };
        let client = &self.client;
        let on_condition_failed = &on_condition_failed;
        self.with_retry(move || {
            let input = input.clone();
            async move {
                client
                    .update_item(input)
                    .await
                    .map_err(|err| update_error(err, on_condition_failed))
            }
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl LeaseStore for DynamoStore {
    async fn create_container_if_not_exists(&self, resource: &Resource) -> StoreResult<()> {
        // The table is the only container; it is provisioned ahead of time
        trace!(%resource, "containers are implicit in DynamoDB");
        Ok(())
    }

    async fn create_exclusive(&self, resource: &Resource) -> StoreResult<()> {
        let item = ResourceItem {
            resource: resource.to_string(),
            metadata: HashMap::new(),
            lease_id: None,
            lease_expires_at: 0,
            lease_duration_millis: 0,
        };
        let input = PutItemInput {
            table_name: self.config.table_name.clone(),
            item: item.into(),
            condition_expression: Some("attribute_not_exists(#r)".to_string()),
            expression_attribute_names: Some(names(&[("#r", "resource")])),
            ..PutItemInput::default()
        };
        let client = &self.client;
        self.with_retry(move || {
            let input = input.clone();
            async move {
                client
                    .put_item(input)
                    .await
                    .map_err(|err| put_error(err, resource))
            }
        })
        .await
        .map(|_| ())
    }

    async fn exists(&self, resource: &Resource) -> StoreResult<bool> {
        Ok(self.get_item(resource, Some("#r")).await?.is_some())
    }

    async fn acquire_lease(&self, resource: &Resource, duration: Duration) -> StoreResult<LeaseId> {
        let lease_id = LeaseId::generate();
        let now = now_millis();
        let result = self
            .update(
                resource,
                "SET #l = :id, #e = :expires, #d = :duration",
                "attribute_exists(#r) AND #e <= :now",
                names(&[
                    ("#l", "lease_id"),
                    ("#e", "lease_expires_at"),
                    ("#d", "lease_duration_millis"),
                    ("#r", "resource"),
                ]),
                values(vec![
                    (":id", lease_id.as_str().to_string().into_attr()),
                    (":expires", (now + millis(duration)).into_attr()),
                    (":duration", millis(duration).into_attr()),
                    (":now", now.into_attr()),
                ]),
                StoreError::Conflict(resource.clone()),
            )
            .await;
        match result {
            Ok(()) => Ok(lease_id),
            // The condition also fails for a missing item
            Err(StoreError::Conflict(_)) => {
                if self.exists(resource).await? {
                    Err(StoreError::Conflict(resource.clone()))
                } else {
                    Err(StoreError::NotFound(resource.clone()))
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn renew_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()> {
        self.update(
            resource,
            "SET #e = :now + #d",
            "#l = :id",
            names(&[
                ("#e", "lease_expires_at"),
                ("#d", "lease_duration_millis"),
                ("#l", "lease_id"),
            ]),
            values(vec![
                (":id", lease_id.as_str().to_string().into_attr()),
                (":now", now_millis().into_attr()),
            ]),
            StoreError::Conflict(resource.clone()),
        )
        .await
    }

    async fn release_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()> {
        self.update(
            resource,
            "SET #l = :none, #e = :zero",
            "#l = :id",
            names(&[("#l", "lease_id"), ("#e", "lease_expires_at")]),
            values(vec![
                (":id", lease_id.as_str().to_string().into_attr()),
                (":none", null_attr()),
                (":zero", 0i64.into_attr()),
            ]),
            StoreError::Conflict(resource.clone()),
        )
        .await
    }

    async fn break_lease(&self, resource: &Resource) -> StoreResult<()> {
        self.update(
            resource,
            "SET #l = :none, #e = :zero",
            "attribute_exists(#r)",
            names(&[("#l", "lease_id"), ("#e", "lease_expires_at"), ("#r", "resource")]),
            values(vec![(":none", null_attr()), (":zero", 0i64.into_attr())]),
            StoreError::NotFound(resource.clone()),
        )
        .await
    }

    async fn get_metadata(&self, resource: &Resource) -> StoreResult<Metadata> {
        match self.get_item(resource, None).await? {
            Some(attrs) => Ok(resource_item(attrs)?.metadata),
            None => Err(StoreError::NotFound(resource.clone())),
        }
    }

    async fn set_metadata(
        &self,
        resource: &Resource,
        metadata: Metadata,
        lease_id: &LeaseId,
    ) -> StoreResult<()> {
        self.update(
            resource,
            "SET #m = :metadata",
            "#l = :id AND #e > :now",
            names(&[
                ("#m", "metadata"),
                ("#l", "lease_id"),
                ("#e", "lease_expires_at"),
            ]),
            values(vec![
                (":metadata", metadata.into_attr()),
                (":id", lease_id.as_str().to_string().into_attr()),
                (":now", now_millis().into_attr()),
            ]),
            StoreError::PreconditionFailed(resource.clone()),
        )
        .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn item_key(resource: &Resource) -> Attributes {
    let mut key = HashMap::new();
    key.insert("resource".to_string(), resource.to_string().into_attr());
    key
}

fn names(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(alias, name)| (alias.to_string(), name.to_string()))
        .collect()
}

fn values(pairs: Vec<(&str, AttributeValue)>) -> HashMap<String, AttributeValue> {
    pairs
        .into_iter()
        .map(|(alias, value)| (alias.to_string(), value))
        .collect()
}

fn null_attr() -> AttributeValue {
    AttributeValue {
        null: Some(true),
        ..AttributeValue::default()
    }
}

fn resource_item(attrs: Attributes) -> StoreResult<ResourceItem> {
    ResourceItem::from_attrs(attrs).map_err(|err| match err {
        AttributeError::InvalidFormat => {
            StoreError::Unexpected("Attribute contains an invalid format".to_string())
        }
        AttributeError::InvalidType => {
            StoreError::Unexpected("Attribute contains invalid type".to_string())
        }
        AttributeError::MissingField { name } => {
            StoreError::Unexpected(format!("Attribute '{}' was missing", name))
        }
    })
}

fn request_error<E: std::error::Error + 'static>(err: RusotoError<E>) -> StoreError {
    let transient = match &err {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => response.status.is_server_error(),
        _ => false,
    };
    if transient {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Unexpected(err.to_string())
    }
}

fn get_error(err: RusotoError<GetItemError>) -> StoreError {
    match err {
        RusotoError::Service(GetItemError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(GetItemError::RequestLimitExceeded(msg))
        | RusotoError::Service(GetItemError::InternalServerError(msg)) => {
            StoreError::Transient(msg)
        }
        err => request_error(err),
    }
}

fn put_error(err: RusotoError<PutItemError>, resource: &Resource) -> StoreError {
    match err {
        RusotoError::Service(PutItemError::ConditionalCheckFailed(_)) => {
            StoreError::AlreadyExists(resource.clone())
        }
        RusotoError::Service(PutItemError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(PutItemError::RequestLimitExceeded(msg))
        | RusotoError::Service(PutItemError::InternalServerError(msg)) => {
            StoreError::Transient(msg)
        }
        err => request_error(err),
    }
}

fn update_error(err: RusotoError<UpdateItemError>, on_condition_failed: &StoreError) -> StoreError {
    match err {
        RusotoError::Service(UpdateItemError::ConditionalCheckFailed(_)) => {
            on_condition_failed.clone()
        }
        RusotoError::Service(UpdateItemError::ProvisionedThroughputExceeded(msg))
        | RusotoError::Service(UpdateItemError::RequestLimitExceeded(msg))
        | RusotoError::Service(UpdateItemError::InternalServerError(msg)) => {
            StoreError::Transient(msg)
        }
        err => request_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Resource {
        Resource::new("jobs", "report")
    }

    #[test]
    fn items_survive_the_attribute_mapping() {
        let mut metadata = HashMap::new();
        metadata.insert("progress".to_string(), "done".to_string());
        let item = ResourceItem {
            resource: report().to_string(),
            metadata,
            lease_id: Some(LeaseId::generate().to_string()),
            lease_expires_at: 1_700_000_000_000,
            lease_duration_millis: 90_000,
        };

        let attrs: Attributes = item.clone().into();
        assert_eq!(resource_item(attrs).unwrap(), item);
    }

    #[test]
    fn unleased_items_map_back_to_no_lease() {
        let item = ResourceItem {
            resource: report().to_string(),
            metadata: HashMap::new(),
            lease_id: None,
            lease_expires_at: 0,
            lease_duration_millis: 0,
        };
        let attrs: Attributes = item.clone().into();
        assert_eq!(resource_item(attrs).unwrap().lease_id, None);
    }

    #[test]
    fn malformed_items_are_unexpected() {
        let mut attrs = item_key(&report());
        attrs.insert("lease_expires_at".to_string(), "soon".to_string().into_attr());
        assert!(matches!(
            resource_item(attrs),
            Err(StoreError::Unexpected(_))
        ));
    }

    #[test]
    fn failed_conditions_map_to_the_callers_meaning() {
        let err = update_error(
            RusotoError::Service(UpdateItemError::ConditionalCheckFailed(
                "The conditional request failed".to_string(),
            )),
            &StoreError::PreconditionFailed(report()),
        );
        assert_eq!(err, StoreError::PreconditionFailed(report()));

        let err = put_error(
            RusotoError::Service(PutItemError::ConditionalCheckFailed(
                "The conditional request failed".to_string(),
            )),
            &report(),
        );
        assert_eq!(err, StoreError::AlreadyExists(report()));
    }

    #[test]
    fn throttling_is_retryable_and_validation_is_not() {
        let throttled = get_error(RusotoError::Service(
            GetItemError::ProvisionedThroughputExceeded("slow down".to_string()),
        ));
        assert!(throttled.is_retryable());

        let invalid = update_error(
            RusotoError::Validation("bad expression".to_string()),
            &StoreError::Conflict(report()),
        );
        assert!(matches!(invalid, StoreError::Unexpected(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoints_are_retried_then_reported_transient() {
        let client = DynamoDbClient::new_with(
            rusoto_core::HttpClient::new().unwrap(),
            rusoto_core::credential::StaticProvider::new_minimal(
                "access".to_string(),
                "secret".to_string(),
            ),
            Region::Custom {
                name: "local".to_string(),
                endpoint: "http://127.0.0.1:1".to_string(),
            },
        );
        let store = DynamoStore::new(
            client,
            DynamoConfig {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
                ..DynamoConfig::default()
            },
        );

        assert!(matches!(
            store.exists(&report()).await,
            Err(StoreError::Transient(_))
        ));
    }

    #[test]
    fn unknown_regions_are_rejected() {
        let config = DynamoConfig {
            region: "mars-north-1".to_string(),
            ..DynamoConfig::default()
        };
        assert!(matches!(
            DynamoStore::from_config(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
