use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::TopicPartitionList;

/// Identity of one partition of one topic; the key of partition ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Converts a broker-provided partition list, ignoring offsets.
    pub fn from_list(list: &TopicPartitionList) -> Vec<Self> {
        list.elements().into_iter().map(Self::from).collect()
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record as delivered by the broker. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl From<&BorrowedMessage<'_>> for Record {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        }
    }
}

/// A fetch failure scoped to a partition when the broker says which one.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            topic: None,
            partition: None,
            message: message.into(),
        }
    }

    pub fn for_partition(partition: &TopicPartition, message: impl Into<String>) -> Self {
        Self {
            topic: Some(partition.topic().to_string()),
            partition: Some(partition.partition()),
            message: message.into(),
        }
    }
}

/// Result of one bounded fetch across all owned partitions.
#[derive(Debug, Default)]
pub struct Fetch {
    pub records: Vec<Record>,
    pub errors: Vec<FetchError>,
    /// The client has been closed; the poll loop must stop.
    pub closed: bool,
}

impl Fetch {
    pub fn closed() -> Self {
        Self {
            closed: true,
            ..Self::default()
        }
    }

    /// Groups records by partition, keeping arrival order within each partition.
    pub fn into_partitions(self) -> BTreeMap<TopicPartition, Vec<Record>> {
        let mut partitions: BTreeMap<TopicPartition, Vec<Record>> = BTreeMap::new();
        for record in self.records {
            partitions
                .entry(record.topic_partition())
                .or_default()
                .push(record);
        }
        partitions
    }
}
