use crate::classifier::Classifier;
use crate::dedup::DedupOutcome;
use crate::frame::Frame;
use crate::model::{Analysis, NewAnalysis, Sample};
use crate::store::SessionStore;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Decides which analysis, if any, a freshly stored sample gets.
#[derive(Clone)]
pub struct AnalysisDispatcher {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn SessionStore>,
}

impl AnalysisDispatcher {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn SessionStore>) -> Self {
        Self { classifier, store }
    }

    /// Duplicates get the "unchanged" sentinel without calling the classifier.
    /// Distinct frames get one classifier attempt; a classifier failure yields
    /// `Ok(None)` and the sample stays unanalyzed. Only a failure to save the
    /// analysis is returned as an error.
    pub async fn dispatch(
        &self,
        sample: &Sample,
        outcome: DedupOutcome,
        frame: &Frame,
    ) -> Result<Option<Analysis>> {
        let analysis = match outcome {
            DedupOutcome::Duplicate => {
                tracing::debug!(sample_id = %sample.id, "frame unchanged, skipping classifier");
                NewAnalysis::unchanged()
            }
            DedupOutcome::Distinct => match self.classifier.classify(frame).await {
                Ok(analysis) => analysis,
                Err(err) => {
                    tracing::warn!(
                        sample_id = %sample.id,
                        error = ?err,
                        "classifier failed, sample left unanalyzed"
                    );
                    return Ok(None);
                }
            },
        };

        let saved = self
            .store
            .save_analysis(&sample.id, analysis)
            .await
            .with_context(|| format!("failed to save analysis for sample {}", sample.id))?;
        Ok(Some(saved))
    }
}

#[cfg(test)]
mod tests {
    use super::AnalysisDispatcher;
    use crate::classifier::Classifier;
    use crate::dedup::DedupOutcome;
    use crate::frame::Frame;
    use crate::model::{ActivityType, NewAnalysis, Sample, SampleLocator};
    use crate::store::{LocalStore, SessionStore};
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingClassifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Classifier for CountingClassifier {
        async fn classify(&self, _frame: &Frame) -> Result<NewAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("model unavailable"));
            }
            Ok(NewAnalysis {
                app_name: "Terminal".to_string(),
                activity_type: ActivityType::Coding,
                description: "running tests".to_string(),
                detailed_content: None,
                tags: Vec::new(),
                confidence: 0.8,
                raw_response: None,
            })
        }
    }

    async fn setup(
        fail: bool,
    ) -> (
        Arc<CountingClassifier>,
        Arc<LocalStore>,
        AnalysisDispatcher,
        Sample,
    ) {
        let classifier = Arc::new(CountingClassifier {
            fail,
            ..CountingClassifier::default()
        });
        let store = Arc::new(LocalStore::in_memory());
        let session = store.create_session("me").await.expect("session");
        let sample = store
            .save_sample(&session.id, &SampleLocator::new("loc"), None, Utc::now())
            .await
            .expect("sample");
        let dispatcher = AnalysisDispatcher::new(classifier.clone(), store.clone());
        (classifier, store, dispatcher, sample)
    }

    #[tokio::test]
    async fn duplicates_get_the_sentinel_without_classifier() {
        let (classifier, _store, dispatcher, sample) = setup(false).await;
        let analysis = dispatcher
            .dispatch(&sample, DedupOutcome::Duplicate, &Frame::new(b"f".to_vec()))
            .await
            .expect("dispatch")
            .expect("analysis");

        assert!(analysis.is_unchanged_sentinel());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn distinct_frames_are_classified() {
        let (classifier, store, dispatcher, sample) = setup(false).await;
        let analysis = dispatcher
            .dispatch(&sample, DedupOutcome::Distinct, &Frame::new(b"f".to_vec()))
            .await
            .expect("dispatch")
            .expect("analysis");

        assert_eq!(analysis.activity_type, ActivityType::Coding);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        let stored = store.list_samples(&sample.session_id).await.expect("list");
        assert_eq!(stored[0].analysis.as_ref(), Some(&analysis));
    }

    #[tokio::test]
    async fn classifier_failure_leaves_sample_unanalyzed() {
        let (classifier, store, dispatcher, sample) = setup(true).await;
        let analysis = dispatcher
            .dispatch(&sample, DedupOutcome::Distinct, &Frame::new(b"f".to_vec()))
            .await
            .expect("dispatch never fails on classifier errors");

        assert!(analysis.is_none());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        let stored = store.list_samples(&sample.session_id).await.expect("list");
        assert!(stored[0].analysis.is_none());
    }
}
