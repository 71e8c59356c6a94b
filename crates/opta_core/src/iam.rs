//! IAM policy documents built from module links.
//!
//! AWS principals (service roles, IAM roles and users, lambdas) get a policy
//! with one statement per kind of access, in a fixed order, so the rendered
//! document is stable across runs. GCP principals only carry bucket grants.

use serde_json::{json, Value};

use crate::error::{OptaError, OptaResult};
use crate::interpolation::module_ref;
use crate::module::Module;

const S3_READ: &[&str] = &["s3:GetObject*", "s3:ListBucket"];
const S3_WRITE: &[&str] = &["s3:GetObject*", "s3:PutObject*", "s3:DeleteObject*", "s3:ListBucket"];
const SQS_PUBLISH: &[&str] = &[
    "sqs:SendMessage",
    "sqs:SendMessageBatch",
    "sqs:GetQueueUrl",
    "sqs:GetQueueAttributes",
];
const SQS_SUBSCRIBE: &[&str] = &[
    "sqs:ReceiveMessage",
    "sqs:DeleteMessage",
    "sqs:DeleteMessageBatch",
    "sqs:ChangeMessageVisibility",
    "sqs:ChangeMessageVisibilityBatch",
    "sqs:GetQueueUrl",
    "sqs:GetQueueAttributes",
];
const SNS_PUBLISH: &[&str] = &["sns:Publish"];
const DYNAMODB_READ: &[&str] = &[
    "dynamodb:BatchGetItem",
    "dynamodb:ConditionCheckItem",
    "dynamodb:DescribeTable",
    "dynamodb:GetItem",
    "dynamodb:Query",
    "dynamodb:Scan",
];
const DYNAMODB_WRITE: &[&str] = &[
    "dynamodb:BatchGetItem",
    "dynamodb:ConditionCheckItem",
    "dynamodb:DescribeTable",
    "dynamodb:GetItem",
    "dynamodb:Query",
    "dynamodb:Scan",
    "dynamodb:BatchWriteItem",
    "dynamodb:DeleteItem",
    "dynamodb:PutItem",
    "dynamodb:UpdateItem",
];
const KMS_WRITE: &[&str] = &["kms:GenerateDataKey", "kms:Decrypt"];
const KMS_READ: &[&str] = &["kms:Decrypt"];

/// Module types an AWS principal can be linked to.
pub const AWS_LINKABLE: &[&str] = &["aws-s3", "aws-sqs", "aws-sns", "aws-dynamodb"];

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn output_ref(target: &Module, output: &str) -> String {
    module_ref(&target.name, output)
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn permission_tokens(
    source: &str,
    target: &Module,
    permissions: &[Value],
    allowed: &[&str],
    default: &[&str],
) -> OptaResult<Vec<String>> {
    if permissions.is_empty() {
        return Ok(default.iter().map(|p| p.to_string()).collect());
    }
    permissions
        .iter()
        .map(|p| match p.as_str() {
            Some(token) if allowed.contains(&token) => Ok(token.to_string()),
            _ => Err(OptaError::validation(
                source,
                format!(
                    "unsupported permission {} for {} link {}; use one of {:?}",
                    p, target.module_type, target.name, allowed
                ),
            )),
        })
        .collect()
}

/// Accumulates resource grants from links and renders the policy document.
#[derive(Debug, Clone, Default)]
pub struct IamAssembler {
    read_buckets: Vec<String>,
    write_buckets: Vec<String>,
    publish_queues: Vec<String>,
    subscribe_queues: Vec<String>,
    publish_topics: Vec<String>,
    read_tables: Vec<String>,
    write_tables: Vec<String>,
    kms_write_keys: Vec<String>,
    kms_read_keys: Vec<String>,
}

impl IamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the access `source` needs to `target`.
    pub fn add_link(&mut self, source: &str, target: &Module, permissions: &[Value]) -> OptaResult<()> {
        let kms_key = || output_ref(target, "kms_arn");
        let arn_of = |output: &str| output_ref(target, output);

        match target.module_type.as_str() {
            "aws-s3" => {
                let bucket = target.get_str("bucket_name").ok_or_else(|| {
                    OptaError::validation(source, format!("linked bucket {} has no bucket_name", target.name))
                })?;
                for token in permission_tokens(source, target, permissions, &["read", "write"], &["write"])? {
                    match token.as_str() {
                        "read" => push_unique(&mut self.read_buckets, bucket.to_string()),
                        _ => push_unique(&mut self.write_buckets, bucket.to_string()),
                    }
                }
            }
            "aws-sqs" => {
                for token in permission_tokens(
                    source,
                    target,
                    permissions,
                    &["publish", "subscribe"],
                    &["publish", "subscribe"],
                )? {
                    match token.as_str() {
                        "publish" => {
                            push_unique(&mut self.publish_queues, arn_of("queue_arn"));
                            push_unique(&mut self.kms_write_keys, kms_key());
                        }
                        _ => {
                            push_unique(&mut self.subscribe_queues, arn_of("queue_arn"));
                            push_unique(&mut self.kms_read_keys, kms_key());
                        }
                    }
                }
            }
            "aws-sns" => {
                permission_tokens(source, target, permissions, &["publish"], &["publish"])?;
                push_unique(&mut self.publish_topics, arn_of("topic_arn"));
                push_unique(&mut self.kms_write_keys, kms_key());
            }
            "aws-dynamodb" => {
                for token in permission_tokens(source, target, permissions, &["read", "write"], &["write"])? {
                    match token.as_str() {
                        "read" => {
                            push_unique(&mut self.read_tables, arn_of("table_arn"));
                            push_unique(&mut self.kms_read_keys, kms_key());
                        }
                        _ => {
                            push_unique(&mut self.write_tables, arn_of("table_arn"));
                            push_unique(&mut self.kms_write_keys, kms_key());
                        }
                    }
                }
            }
            other => {
                return Err(OptaError::validation(
                    source,
                    format!("cannot grant IAM access to module {} of type {}", target.name, other),
                ))
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.statements().is_empty()
    }

    /// Statements for every grant recorded so far.
    pub fn statements(&self) -> Vec<Value> {
        let mut statements = Vec::new();
        let bucket_resources = |buckets: &[String]| -> Vec<String> {
            buckets
                .iter()
                .flat_map(|b| [format!("arn:aws:s3:::{}", b), format!("arn:aws:s3:::{}/*", b)])
                .collect()
        };
        let table_resources = |tables: &[String]| -> Vec<String> {
            tables
                .iter()
                .flat_map(|t| [t.clone(), format!("{}/index/*", t)])
                .collect()
        };

        let mut push = |sid: &str, actions: &[&str], resources: Vec<String>| {
            if !resources.is_empty() {
                statements.push(json!({
                    "Sid": sid,
                    "Effect": "Allow",
                    "Action": actions,
                    "Resource": resources,
                }));
            }
        };

        push("ReadBuckets", S3_READ, bucket_resources(&self.read_buckets));
        push("WriteBuckets", S3_WRITE, bucket_resources(&self.write_buckets));
        push("PublishQueues", SQS_PUBLISH, self.publish_queues.clone());
        push("SubscribeQueues", SQS_SUBSCRIBE, self.subscribe_queues.clone());
        push("PublishSns", SNS_PUBLISH, self.publish_topics.clone());
        push("ReadDynamodb", DYNAMODB_READ, table_resources(&self.read_tables));
        push("WriteDynamodb", DYNAMODB_WRITE, table_resources(&self.write_tables));
        push("KMSWrite", KMS_WRITE, self.kms_write_keys.clone());
        push("KMSRead", KMS_READ, self.kms_read_keys.clone());
        statements
    }

    /// The full policy document. It always carries a harmless base statement
    /// so an empty policy is still valid.
    pub fn policy_document(&self) -> Value {
        let mut statements = vec![json!({
            "Sid": "PolicySimulator",
            "Effect": "Allow",
            "Action": ["iam:SimulatePrincipalPolicy"],
            "Resource": "*",
        })];
        statements.extend(self.statements());
        json!({ "Version": "2012-10-17", "Statement": statements })
    }
}

/// Bucket grants for GCP principals.
#[derive(Debug, Clone, Default)]
pub struct GcsBucketGrants {
    pub read_buckets: Vec<String>,
    pub write_buckets: Vec<String>,
}

impl GcsBucketGrants {
    pub fn add_link(&mut self, source: &str, target: &Module, permissions: &[Value]) -> OptaResult<()> {
        if target.module_type != "gcp-gcs" {
            return Err(OptaError::validation(
                source,
                format!("cannot grant bucket access to module {} of type {}", target.name, target.module_type),
            ));
        }
        let bucket = target.get_str("bucket_name").ok_or_else(|| {
            OptaError::validation(source, format!("linked bucket {} has no bucket_name", target.name))
        })?;
        for token in permission_tokens(source, target, permissions, &["read", "write"], &["write"])? {
            match token.as_str() {
                "read" => push_unique(&mut self.read_buckets, bucket.to_string()),
                _ => push_unique(&mut self.write_buckets, bucket.to_string()),
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, module: &mut Module) {
        module.set("read_buckets", json!(self.read_buckets));
        module.set("write_buckets", json!(self.write_buckets));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::{Cloud, Registry};
    use std::path::Path;

    fn module(cloud: Cloud, entry: Value) -> Module {
        let registry = Registry::embedded().unwrap();
        Module::new(&registry, cloud, &entry, Path::new("/m"), Path::new("/")).unwrap()
    }

    #[test]
    fn test_default_bucket_permission_is_write() {
        let bucket = module(Cloud::Aws, json!({"type": "aws-s3", "name": "bucket", "bucket_name": "b"}));
        let mut iam = IamAssembler::new();
        iam.add_link("app", &bucket, &[]).unwrap();

        let doc = iam.policy_document();
        assert_eq!(doc["Version"], "2012-10-17");
        assert_eq!(doc["Statement"][0]["Sid"], "PolicySimulator");
        let write = &doc["Statement"][1];
        assert_eq!(write["Sid"], "WriteBuckets");
        assert_eq!(
            write["Action"],
            json!(["s3:GetObject*", "s3:PutObject*", "s3:DeleteObject*", "s3:ListBucket"])
        );
        assert_eq!(write["Resource"], json!(["arn:aws:s3:::b", "arn:aws:s3:::b/*"]));
    }

    #[test]
    fn test_queue_grants_include_kms() {
        let queue = module(Cloud::Aws, json!({"type": "aws-sqs", "name": "queue"}));
        let mut iam = IamAssembler::new();
        iam.add_link("app", &queue, &[json!("subscribe")]).unwrap();
        let sids: Vec<String> = iam
            .statements()
            .iter()
            .map(|s| s["Sid"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(sids, vec!["SubscribeQueues", "KMSRead"]);
        assert_eq!(iam.statements()[0]["Resource"], json!(["${{module.queue.queue_arn}}"]));
    }

    #[test]
    fn test_linking_twice_is_stable() {
        let table = module(Cloud::Aws, json!({"type": "aws-dynamodb", "name": "table", "hash_key": "id", "attributes": []}));
        let mut iam = IamAssembler::new();
        iam.add_link("app", &table, &[json!("read")]).unwrap();
        let once = iam.policy_document();
        iam.add_link("app", &table, &[json!("read")]).unwrap();
        assert_eq!(iam.policy_document(), once);
    }

    #[test]
    fn test_bad_permission() {
        let bucket = module(Cloud::Aws, json!({"type": "aws-s3", "name": "bucket", "bucket_name": "b"}));
        let mut iam = IamAssembler::new();
        assert!(iam.add_link("app", &bucket, &[json!("publish")]).is_err());
    }

    #[test]
    fn test_gcs_grants() {
        let bucket = module(Cloud::Google, json!({"type": "gcp-gcs", "name": "files", "bucket_name": "my-files"}));
        let mut grants = GcsBucketGrants::default();
        grants.add_link("app", &bucket, &[json!("read")]).unwrap();
        assert_eq!(grants.read_buckets, vec!["my-files"]);
        assert!(grants.write_buckets.is_empty());
    }
}
