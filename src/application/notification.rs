use crate::config::Config;
use crate::domain::ports::{
    EmailMessage, EmailSenderHandle, LedgerStoreHandle, ObjectStorageHandle,
};
use crate::domain::workflow::{ActivityCategory, PendingTask};
use crate::error::NotificationError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info};

/// What a handler reports after delivering its one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub recipient: String,
    pub message: String,
}

/// Turns a pending human task into exactly one outbound message.
///
/// Handlers only notify. The run is resumed later, by whoever holds the
/// task token.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    fn category(&self) -> ActivityCategory;
    async fn handle(&self, task: &PendingTask) -> Result<NotificationReceipt, NotificationError>;
}

/// Settings shared by both handlers.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Base for resumption links, ending in `/`.
    pub resume_base_url: String,
    pub image_link_ttl: Duration,
    pub sender: Option<String>,
}

impl From<&Config> for LinkSettings {
    fn from(config: &Config) -> Self {
        Self {
            resume_base_url: config.resume_base_url.clone(),
            image_link_ttl: config.image_link_ttl,
            sender: config.sender_email.clone(),
        }
    }
}

async fn image_link(
    storage: &ObjectStorageHandle,
    task: &PendingTask,
    ttl: Duration,
) -> Result<String, NotificationError> {
    storage
        .presigned_get(&task.event.bucket, &task.event.key, ttl)
        .await
        .map_err(|e| NotificationError::LookupFailed(format!("Image link: {}", e)))
}

async fn deliver(
    mailer: &EmailSenderHandle,
    message: EmailMessage,
) -> Result<NotificationReceipt, NotificationError> {
    info!(to = %message.to, subject = %message.subject, "About to send email");
    match mailer.send(&message).await {
        Ok(()) => Ok(NotificationReceipt {
            recipient: message.to,
            message: "The email was successfully sent.".to_string(),
        }),
        Err(e) => {
            error!(to = %message.to, error = %e, "Email could not be sent");
            Err(NotificationError::SendFailed(e.to_string()))
        }
    }
}

/// Asks the operator to read a plate the pipeline could not.
pub struct UnknownPlateHandler {
    storage: ObjectStorageHandle,
    mailer: EmailSenderHandle,
    operator: Option<String>,
    links: LinkSettings,
}

impl UnknownPlateHandler {
    pub fn new(
        storage: ObjectStorageHandle,
        mailer: EmailSenderHandle,
        operator: Option<String>,
        links: LinkSettings,
    ) -> Self {
        Self {
            storage,
            mailer,
            operator,
            links,
        }
    }

    pub fn resume_link(&self, task: &PendingTask, image_link: &str) -> String {
        format!(
            "{}parse/{}/{}/{}?imageLink={}&taskToken={}",
            self.links.resume_base_url,
            task.event.bucket,
            task.event.key,
            task.charge,
            urlencoding::encode(image_link),
            urlencoding::encode(task.token.as_str())
        )
    }
}

#[async_trait]
impl NotificationHandler for UnknownPlateHandler {
    fn category(&self) -> ActivityCategory {
        ActivityCategory::ManualPlateInspection
    }

    async fn handle(&self, task: &PendingTask) -> Result<NotificationReceipt, NotificationError> {
        let operator = self
            .operator
            .clone()
            .ok_or_else(|| NotificationError::NoRecipient("operator address".to_string()))?;
        let image = image_link(&self.storage, task, self.links.image_link_ttl).await?;
        let resume = self.resume_link(task, &image);

        let html_body = format!(
            "Hello {operator},<br /><br />An image was captured at a toll booth, but the number plate \
             could not be determined with enough confidence. Please take a look at the image and \
             provide the number plate.<br/><br/>\
             <img src=\"{image}\"/><br/><a href=\"{image}\">Click here to see the original image</a><br/><br/>\
             <a href=\"{resume}\"><b>Click this link to assess the image and provide the number plate.</b></a><br/>\
             <br/><br/>Thanks<br/><b>Toll Road Administrator</b><br/>"
        );

        deliver(
            &self.mailer,
            EmailMessage {
                from: self.links.sender.clone().or_else(|| Some(operator.clone())),
                to: operator,
                subject: "[ACTION] - Manual Decision Required!".to_string(),
                html_body,
            },
        )
        .await
    }
}

/// Asks the vehicle owner to top up their account.
pub struct InsufficientCreditHandler {
    storage: ObjectStorageHandle,
    ledger: LedgerStoreHandle,
    mailer: EmailSenderHandle,
    links: LinkSettings,
}

impl InsufficientCreditHandler {
    pub fn new(
        storage: ObjectStorageHandle,
        ledger: LedgerStoreHandle,
        mailer: EmailSenderHandle,
        links: LinkSettings,
    ) -> Self {
        Self {
            storage,
            ledger,
            mailer,
            links,
        }
    }

    pub fn resume_link(&self, plate: &str, task: &PendingTask) -> String {
        format!(
            "{}topup/{}?taskToken={}",
            self.links.resume_base_url,
            urlencoding::encode(plate),
            urlencoding::encode(task.token.as_str())
        )
    }
}

#[async_trait]
impl NotificationHandler for InsufficientCreditHandler {
    fn category(&self) -> ActivityCategory {
        ActivityCategory::InsufficientCredit
    }

    async fn handle(&self, task: &PendingTask) -> Result<NotificationReceipt, NotificationError> {
        let plate = &task.plate.plate;
        let record = self
            .ledger
            .get(plate)
            .await
            .map_err(|e| {
                NotificationError::LookupFailed(format!(
                    "An error occurred while accessing the database for number plate {}: {}",
                    plate, e
                ))
            })?
            .ok_or_else(|| NotificationError::RecordMissing(plate.clone()))?;

        if record.owner_email.trim().is_empty() {
            return Err(NotificationError::NoRecipient(format!(
                "owner of number plate {}",
                plate
            )));
        }

        let image = image_link(&self.storage, task, self.links.image_link_ttl).await?;
        let resume = self.resume_link(&record.plate, task);
        let html_body = format!(
            "Hello {owner},<br /><br />Your vehicle with number plate <b>{plate}</b> was recently \
             detected on a toll road, but your account has insufficient credit (${credit}) to pay \
             the toll of ${charge}.<br/><br/>\
             <img src=\"{image}\"/><br/><a href=\"{image}\">Click here to see the original image</a><br/><br/>\
             Please update your account balance immediately to avoid a fine. \
             <a href=\"{resume}\"><b>Click this link to top up your account now.</b></a><br/>\
             <br/><br/>Thanks<br/><b>Toll Road Administrator</b><br/>",
            owner = record.owner_name(),
            plate = record.plate,
            credit = record.credit,
            charge = task.charge,
        );

        deliver(
            &self.mailer,
            EmailMessage {
                from: self.links.sender.clone(),
                to: record.owner_email.clone(),
                subject: "[ACTION] - Your account credit is exhausted".to_string(),
                html_body,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::{Charge, LedgerRecord};
    use crate::domain::ports::LedgerStore;
    use crate::domain::toll_event::{PlateDetection, TollEvent};
    use crate::domain::workflow::{RunId, TaskToken};
    use crate::infrastructure::in_memory::{
        InMemoryLedgerStore, InMemoryObjectStorage, RecordingMailer,
    };
    use chrono::Utc;
    use std::sync::Arc;

    fn links() -> LinkSettings {
        LinkSettings {
            resume_base_url: "https://tolls.example.com/".to_string(),
            image_link_ttl: Duration::from_secs(3600),
            sender: Some("tolls@example.com".to_string()),
        }
    }

    fn task(category: ActivityCategory, plate: PlateDetection) -> PendingTask {
        let charge = Charge::new(5).unwrap();
        PendingTask {
            token: TaskToken::from("tok/en+1"),
            run_id: RunId::new(),
            category,
            event: TollEvent {
                bucket: "gantry".into(),
                key: "cam1/0001.jpg".into(),
                content_type: "image/jpeg".into(),
                content_length: 10,
                charge,
                plate: plate.clone(),
            },
            plate,
            charge,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_plate_email_to_operator() {
        let mailer = Arc::new(RecordingMailer::new());
        let handler = UnknownPlateHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            mailer.clone(),
            Some("ops@example.com".to_string()),
            links(),
        );

        let receipt = handler
            .handle(&task(
                ActivityCategory::ManualPlateInspection,
                PlateDetection::not_detected(".*"),
            ))
            .await
            .unwrap();

        assert_eq!(receipt.recipient, "ops@example.com");
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[ACTION] - Manual Decision Required!");
        assert!(sent[0].html_body.contains(
            "https://tolls.example.com/parse/gantry/cam1/0001.jpg/5?imageLink=memory%3A%2F%2F"
        ));
        assert!(sent[0].html_body.contains("taskToken=tok%2Fen%2B1"));
    }

    #[tokio::test]
    async fn test_missing_operator_is_distinct_from_send_failure() {
        let mailer = Arc::new(RecordingMailer::new());
        let unconfigured = UnknownPlateHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            mailer.clone(),
            None,
            links(),
        );
        let task = task(
            ActivityCategory::ManualPlateInspection,
            PlateDetection::not_detected(".*"),
        );
        assert!(matches!(
            unconfigured.handle(&task).await,
            Err(NotificationError::NoRecipient(_))
        ));

        mailer.fail_sends(true);
        let configured = UnknownPlateHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            mailer.clone(),
            Some("ops@example.com".to_string()),
            links(),
        );
        assert!(matches!(
            configured.handle(&task).await,
            Err(NotificationError::SendFailed(_))
        ));
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_credit_email_to_owner() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        ledger
            .upsert(LedgerRecord::new("ABC123", 3).with_owner("Jane", "Doe", "jane@example.com"))
            .await
            .unwrap();
        let mailer = Arc::new(RecordingMailer::new());
        let handler = InsufficientCreditHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            ledger,
            mailer.clone(),
            links(),
        );

        handler
            .handle(&task(
                ActivityCategory::InsufficientCredit,
                PlateDetection::detected("ABC123", 99.0, ".*"),
            ))
            .await
            .unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "jane@example.com");
        assert_eq!(sent[0].subject, "[ACTION] - Your account credit is exhausted");
        assert!(sent[0].html_body.contains("Hello Jane Doe"));
        assert!(
            sent[0]
                .html_body
                .contains("https://tolls.example.com/topup/ABC123?taskToken=tok%2Fen%2B1")
        );
    }

    #[tokio::test]
    async fn test_insufficient_credit_without_owner_email() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        ledger.upsert(LedgerRecord::new("ABC123", 3)).await.unwrap();
        let handler = InsufficientCreditHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            ledger,
            Arc::new(RecordingMailer::new()),
            links(),
        );
        let task = task(
            ActivityCategory::InsufficientCredit,
            PlateDetection::detected("ABC123", 99.0, ".*"),
        );
        assert!(matches!(
            handler.handle(&task).await,
            Err(NotificationError::NoRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_credit_unknown_record() {
        let handler = InsufficientCreditHandler::new(
            Arc::new(InMemoryObjectStorage::new()),
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(RecordingMailer::new()),
            links(),
        );
        let task = task(
            ActivityCategory::InsufficientCredit,
            PlateDetection::detected("GHOST1", 99.0, ".*"),
        );
        assert!(matches!(
            handler.handle(&task).await,
            Err(NotificationError::RecordMissing(_))
        ));
    }
}
