//! The request/deliver pipeline.
//!
//! Nothing here takes the topology lock: [`request`] follows the consumer's
//! current provider link straight to the provider's node operations, and
//! [`deliver`] runs the bio's completion route in whatever context calls it,
//! including from inside `request` itself.

use crossbeam_channel::bounded;

use crate::bio::{Bio, BioCommand, BioState, Completion};
use crate::error::BioError;
use crate::topology::ConsumerRef;

/// Sends `bio` down through `consumer`.
///
/// Never fails synchronously. An unattached consumer, a failed provider,
/// missing access rights or a misaligned or out-of-range request all end in
/// [`deliver`] with an error. A read or write that crosses the end of the
/// media is truncated; one starting exactly at the end completes empty.
pub fn request(mut bio: Bio, consumer: &ConsumerRef) {
    bio.from = Some(consumer.clone());
    bio.to = None;
    bio.state = BioState::Queued;
    consumer.stats().start();

    let Some(provider) = consumer.provider() else {
        tracing::trace!(target: "stratum::bio", consumer = %consumer.id(), "request on unattached consumer");
        deliver(bio, Err(BioError::NoDevice));
        return;
    };
    provider.stats().start();
    bio.to = Some(provider.clone());

    if let Some(err) = provider.error() {
        deliver(bio, Err(err));
        return;
    }

    let access = consumer.access();
    let permitted = match bio.cmd {
        BioCommand::Read => access.read > 0,
        BioCommand::Write | BioCommand::Delete | BioCommand::Flush => access.write > 0,
        BioCommand::GetAttr => true,
    };
    if !permitted {
        tracing::debug!(
            target: "stratum::bio",
            consumer = %consumer.id(),
            cmd = ?bio.cmd,
            %access,
            "request without access"
        );
        deliver(bio, Err(BioError::NotPermitted));
        return;
    }

    if bio.cmd.is_ranged() {
        let sector = u64::from(provider.sectorsize());
        if bio.offset % sector != 0 || bio.length % sector != 0 {
            deliver(bio, Err(BioError::InvalidArgument));
            return;
        }
        let media = provider.mediasize();
        if bio.offset > media {
            deliver(bio, Err(BioError::InvalidArgument));
            return;
        }
        if bio.offset == media {
            bio.completed = 0;
            deliver(bio, Ok(()));
            return;
        }
        if bio.length > media - bio.offset {
            let length = media - bio.offset;
            tracing::trace!(target: "stratum::bio", offset = bio.offset, from = bio.length, to = length, "request truncated at media end");
            bio.length = length;
            if bio.cmd != BioCommand::Delete {
                bio.data.truncate(length as usize);
            }
        }
    }

    bio.state = BioState::Dispatched;
    tracing::trace!(
        target: "stratum::bio",
        provider = %provider.name(),
        cmd = ?bio.cmd,
        offset = bio.offset,
        length = bio.length,
        "dispatch"
    );
    provider.ops().start(bio);
}

/// Completes `bio` with `result` and runs its completion route.
///
/// On success the node is expected to have set [`Bio::completed`].
pub fn deliver(mut bio: Bio, result: Result<(), BioError>) {
    bio.error = result.err();
    bio.state = BioState::Completed;
    let failed = bio.error.is_some();
    if let Some(provider) = &bio.to {
        provider.stats().end(failed);
    }
    if let Some(consumer) = &bio.from {
        consumer.stats().end(failed);
    }
    if let Some(err) = bio.error {
        tracing::debug!(target: "stratum::bio", cmd = ?bio.cmd, offset = bio.offset, %err, "bio failed");
    }
    let done = std::mem::replace(&mut bio.done, Completion::Discard);
    done.complete(bio);
}

/// Delivers `bio` as fully transferred.
pub fn complete(mut bio: Bio) {
    bio.completed = bio.length;
    deliver(bio, Ok(()));
}

/// Forwards `bio` unchanged to `consumer`, completing it when the forwarded
/// copy completes.
pub fn pass_through(bio: Bio, consumer: &ConsumerRef) {
    let family = bio.fan_out();
    let child = family.clone_bio();
    family.seal();
    request(child, consumer);
}

fn wait(bio: Bio, consumer: &ConsumerRef) -> Result<Bio, BioError> {
    let (tx, rx) = bounded(1);
    request(bio.with_completion(tx), consumer);
    let bio = rx.recv().map_err(|_| BioError::Io)?;
    bio.result()?;
    Ok(bio)
}

/// Reads `length` bytes at `offset` and blocks until they arrive.
///
/// Returns fewer bytes than asked when the read was truncated at the media
/// end.
pub fn read_data(consumer: &ConsumerRef, offset: u64, length: u64) -> Result<Vec<u8>, BioError> {
    let bio = wait(Bio::read(offset, length), consumer)?;
    let mut data = bio.data;
    data.truncate(bio.completed as usize);
    Ok(data)
}

/// Writes `data` at `offset` and blocks until the write completes.
pub fn write_data(consumer: &ConsumerRef, offset: u64, data: Vec<u8>) -> Result<(), BioError> {
    wait(Bio::write(offset, data), consumer).map(|_| ())
}

/// Queries attribute `name` with room for `length` bytes and blocks for the
/// answer.
pub fn getattr(consumer: &ConsumerRef, name: &str, length: usize) -> Result<Vec<u8>, BioError> {
    let bio = wait(Bio::getattr(name, length), consumer)?;
    let mut data = bio.data;
    data.truncate(bio.completed as usize);
    Ok(data)
}
