//! [`AwsApi`] backed by the AWS SDK.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{AwsApi, EksCluster, LOCK_KEY_ATTRIBUTE};
use crate::error::{IacError, IacResult};

/// Error codes S3 returns when a bucket or key is absent.
const S3_MISSING_CODES: [&str; 2] = ["NoSuchBucket", "NoSuchKey"];

struct Clients {
    s3: aws_sdk_s3::Client,
    dynamodb: aws_sdk_dynamodb::Client,
    eks: aws_sdk_eks::Client,
}

impl Clients {
    fn new(shared: &SdkConfig) -> Self {
        Self {
            s3: aws_sdk_s3::Client::new(shared),
            dynamodb: aws_sdk_dynamodb::Client::new(shared),
            eks: aws_sdk_eks::Client::new(shared),
        }
    }
}

/// SDK clients for one region, built on first use from the default
/// credential chain.
pub struct SdkAws {
    region: Option<String>,
    clients: OnceCell<Clients>,
}

impl SdkAws {
    pub fn new(region: Option<&str>) -> Self {
        Self {
            region: region.map(str::to_string),
            clients: OnceCell::new(),
        }
    }

    async fn clients(&self) -> &Clients {
        self.clients
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                debug!("Loading AWS config (region {:?})", self.region);
                Clients::new(&loader.load().await)
            })
            .await
    }
}

fn sdk_error<E>(operation: &str, err: aws_sdk_s3::error::SdkError<E>) -> IacError
where
    E: std::error::Error + Send + Sync + 'static,
{
    IacError::provider(operation, DisplayErrorContext(&err))
}

fn is_s3_missing<E: ProvideErrorMetadata>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    err.as_service_error()
        .and_then(ProvideErrorMetadata::code)
        .is_some_and(|code| S3_MISSING_CODES.contains(&code))
}

fn lock_key(lock_id: &str) -> AttributeValue {
    AttributeValue::S(lock_id.to_string())
}

#[async_trait]
impl AwsApi for SdkAws {
    async fn get_object(&self, bucket: &str, key: &str) -> IacResult<Option<Vec<u8>>> {
        let s3 = &self.clients().await.s3;
        let output = match s3.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) if is_s3_missing(&e) => return Ok(None),
            Err(e) => return Err(sdk_error("Reading S3 object", e)),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| IacError::provider("Reading S3 object", e))?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> IacResult<()> {
        let s3 = &self.clients().await.s3;
        s3.put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("Writing S3 object", e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> IacResult<()> {
        let s3 = &self.clients().await.s3;
        match s3.delete_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(()),
            Err(e) if is_s3_missing(&e) => Ok(()),
            Err(e) => Err(sdk_error("Deleting S3 object", e)),
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> IacResult<Vec<String>> {
        let s3 = &self.clients().await.s3;
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let request = s3
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take());
            let output = match request.send().await {
                Ok(output) => output,
                Err(e) if is_s3_missing(&e) => return Ok(Vec::new()),
                Err(e) => return Err(sdk_error("Listing S3 objects", e)),
            };
            keys.extend(output.contents().iter().filter_map(|o| o.key()).map(str::to_string));
            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => return Ok(keys),
            }
        }
    }

    async fn list_buckets(&self) -> IacResult<Vec<String>> {
        let s3 = &self.clients().await.s3;
        let output = s3
            .list_buckets()
            .send()
            .await
            .map_err(|e| sdk_error("Listing S3 buckets", e))?;
        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name())
            .map(str::to_string)
            .collect())
    }

    /// State buckets are versioned, so every version and delete marker goes
    /// before the bucket itself.
    async fn delete_bucket(&self, bucket: &str) -> IacResult<()> {
        let s3 = &self.clients().await.s3;
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let request = s3
                .list_object_versions()
                .bucket(bucket)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take());
            let output = match request.send().await {
                Ok(output) => output,
                Err(e) if is_s3_missing(&e) => return Ok(()),
                Err(e) => return Err(sdk_error("Listing S3 object versions", e)),
            };
            let versions = output
                .versions()
                .iter()
                .map(|v| (v.key(), v.version_id()))
                .chain(output.delete_markers().iter().map(|m| (m.key(), m.version_id())));
            for (key, version) in versions {
                let Some(key) = key else { continue };
                s3.delete_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version.map(str::to_string))
                    .send()
                    .await
                    .map_err(|e| sdk_error("Deleting S3 object version", e))?;
            }
            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            version_marker = output.next_version_id_marker().map(str::to_string);
        }
        match s3.delete_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if is_s3_missing(&e) => Ok(()),
            Err(e) => Err(sdk_error("Deleting S3 bucket", e)),
        }
    }

    async fn get_lock_info(&self, table: &str, lock_id: &str) -> IacResult<Option<String>> {
        let dynamodb = &self.clients().await.dynamodb;
        let request = dynamodb
            .get_item()
            .table_name(table)
            .key(LOCK_KEY_ATTRIBUTE, lock_key(lock_id))
            .consistent_read(true);
        let output = match request.send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_resource_not_found_exception()) => {
                return Ok(None)
            }
            Err(e) => return Err(sdk_error("Reading terraform lock", e)),
        };
        Ok(output
            .item()
            .and_then(|item| item.get("Info"))
            .and_then(|info| info.as_s().ok())
            .cloned())
    }

    async fn delete_lock_item(&self, table: &str, lock_id: &str) -> IacResult<()> {
        let dynamodb = &self.clients().await.dynamodb;
        let request = dynamodb
            .delete_item()
            .table_name(table)
            .key(LOCK_KEY_ATTRIBUTE, lock_key(lock_id));
        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_resource_not_found_exception()) => Ok(()),
            Err(e) => Err(sdk_error("Deleting terraform lock item", e)),
        }
    }

    async fn delete_table(&self, table: &str) -> IacResult<()> {
        let dynamodb = &self.clients().await.dynamodb;
        match dynamodb.delete_table().table_name(table).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_resource_not_found_exception()) => Ok(()),
            Err(e) => Err(sdk_error("Deleting lock table", e)),
        }
    }

    async fn describe_cluster(&self, name: &str) -> IacResult<Option<EksCluster>> {
        let eks = &self.clients().await.eks;
        let output = match eks.describe_cluster().name(name).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_resource_not_found_exception()) => {
                return Ok(None)
            }
            Err(e) => return Err(sdk_error("Describing EKS cluster", e)),
        };
        Ok(output.cluster().map(|cluster| EksCluster {
            arn: cluster.arn().unwrap_or(name).to_string(),
            endpoint: cluster.endpoint().unwrap_or_default().to_string(),
            ca_data: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .unwrap_or_default()
                .to_string(),
        }))
    }
}
