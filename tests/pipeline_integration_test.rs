//! End-to-end pipeline tests over the in-memory store

use meridian::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_engine(store: Arc<InMemoryStore>) -> Arc<Engine> {
    let config = Config::for_testing();
    let maps = Arc::new(GlobalMaps::new(Arc::new(InMemoryMapBackend::new())));
    let bus = Arc::new(LocalEventBus::new(config.server_id()));
    Engine::new(config, store, bus, maps, Arc::new(PassthroughScriptEngine))
}

fn file_writer(meta_data_id: i32, dir: &tempfile::TempDir) -> DestinationConfig {
    DestinationConfig::new(
        meta_data_id,
        "File Out",
        DestinationKind::FileWriter(FileWriterSettings {
            output_dir: dir.path().to_str().unwrap().to_string(),
            file_name: "${message_id}.out".to_string(),
            append: false,
        }),
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn simple_receive_one_hop_send() {
        let input = tempfile::tempdir().unwrap();
        let processed = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store.clone());
        engine.start().await.unwrap();

        let mut reader = FileReaderSettings {
            input_dir: input.path().to_str().unwrap().to_string(),
            move_to_dir: Some(processed.path().to_str().unwrap().to_string()),
            ..Default::default()
        };
        reader.poll_interval = Duration::from_millis(50);

        let channel = ChannelConfig::new("filechan", "File In", SourceConfig::file_reader(reader))
            .add_destination(file_writer(1, &output));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("filechan").await.unwrap();

        // 256-byte payload dropped into the input directory
        let payload = "X".repeat(256);
        std::fs::write(input.path().join("msg1.txt"), &payload).unwrap();

        let out_path = output.path().join("1.out");
        wait_for("output file", || out_path.exists()).await;
        assert_eq!(std::fs::read_to_string(&out_path).unwrap(), payload);

        // consumed file moved out of the input directory
        assert!(!input.path().join("msg1.txt").exists());
        assert!(processed.path().join("msg1.txt").exists());

        // statuses: source transformed, destination sent
        assert_eq!(
            store
                .connector_message_status("filechan", 1, 0)
                .await
                .unwrap(),
            Some(Status::Transformed)
        );
        assert_eq!(
            store
                .connector_message_status("filechan", 1, 1)
                .await
                .unwrap(),
            Some(Status::Sent)
        );

        // content persisted
        let raw = store
            .load_content("filechan", 1, 0, ContentType::Raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.content, payload);

        engine.stop_channel("filechan").await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn message_ids_are_monotonic_per_channel() {
        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store);
        engine.start().await.unwrap();

        let channel = ChannelConfig::new("mono", "Monotonic", SourceConfig::channel_reader());
        engine.deploy(channel).await.unwrap();
        engine.start_channel("mono").await.unwrap();

        let mut last = 0;
        for i in 0..25 {
            let outcome = engine
                .dispatch_raw_message("mono", RawMessage::new(format!("m{}", i)))
                .await
                .unwrap();
            assert!(outcome.message_id > last, "ids must strictly increase");
            last = outcome.message_id;
        }
    }

    #[tokio::test]
    async fn filtered_message_skips_destinations() {
        struct RejectingEngine;

        #[async_trait::async_trait]
        impl ScriptEngine for RejectingEngine {
            async fn run_filter(&self, _: &str, _: &mut ScriptScope) -> Result<bool> {
                Ok(false)
            }
            async fn run_transformer(&self, _: &str, _: &mut ScriptScope) -> Result<()> {
                Ok(())
            }
            async fn run_preprocessor(
                &self,
                _: &str,
                _: &mut ScriptScope,
            ) -> Result<Option<String>> {
                Ok(None)
            }
            async fn run_postprocessor(
                &self,
                _: &str,
                _: &mut ScriptScope,
            ) -> Result<Option<Response>> {
                Ok(None)
            }
            async fn run_response_transformer(&self, _: &str, _: &mut ScriptScope) -> Result<()> {
                Ok(())
            }
            async fn run_lifecycle_script(&self, _: &str, _: &mut ScriptScope) -> Result<()> {
                Ok(())
            }
            async fn run_destination(
                &self,
                _: &str,
                _: &mut ScriptScope,
            ) -> Result<ScriptOutcome> {
                Ok(ScriptOutcome::Empty)
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let config = Config::for_testing();
        let maps = Arc::new(GlobalMaps::new(Arc::new(InMemoryMapBackend::new())));
        let bus = Arc::new(LocalEventBus::new(config.server_id()));
        let engine = Engine::new(config, store.clone(), bus, maps, Arc::new(RejectingEngine));
        engine.start().await.unwrap();

        let output = tempfile::tempdir().unwrap();
        let mut channel =
            ChannelConfig::new("filt", "Filtered", SourceConfig::channel_reader())
                .add_destination(file_writer(1, &output));
        channel.source.filter = Some("return false".to_string());
        engine.deploy(channel).await.unwrap();
        engine.start_channel("filt").await.unwrap();

        engine
            .dispatch_raw_message("filt", RawMessage::new("rejected"))
            .await
            .unwrap();

        assert_eq!(
            store.connector_message_status("filt", 1, 0).await.unwrap(),
            Some(Status::Filtered)
        );
        // no destination row was ever created
        assert_eq!(
            store.connector_message_status("filt", 1, 1).await.unwrap(),
            None
        );
        assert!(std::fs::read_dir(output.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn metadata_columns_sync_on_redeploy() {
        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store.clone());
        engine.start().await.unwrap();

        let mut channel = ChannelConfig::new("meta", "Meta", SourceConfig::channel_reader());
        channel.metadata_columns = vec![
            MetadataColumn {
                name: "A".into(),
                column_type: MetadataColumnType::String,
                mapping: None,
            },
            MetadataColumn {
                name: "B".into(),
                column_type: MetadataColumnType::Number,
                mapping: None,
            },
        ];
        engine.deploy(channel.clone()).await.unwrap();

        let mut names = store.metadata_column_names("meta").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        engine.undeploy("meta").await.unwrap();
        channel.revision += 1;
        channel.metadata_columns = vec![
            MetadataColumn {
                name: "B".into(),
                column_type: MetadataColumnType::Number,
                mapping: None,
            },
            MetadataColumn {
                name: "C".into(),
                column_type: MetadataColumnType::Boolean,
                mapping: None,
            },
        ];
        engine.deploy(channel).await.unwrap();

        let mut names = store.metadata_column_names("meta").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn shadow_mode_blocks_source_until_promotion() {
        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store);
        engine.start().await.unwrap();
        engine.set_shadow_mode(true).await;

        let channel = ChannelConfig::new("shdw", "Shadowed", SourceConfig::channel_reader());
        engine.deploy(channel).await.unwrap();
        // starting succeeds, but the receive endpoint refuses
        engine.start_channel("shdw").await.unwrap();
        let refused = engine
            .dispatch_raw_message("shdw", RawMessage::new("early"))
            .await;
        assert!(matches!(refused, Err(EngineError::ShadowMode)));

        engine.promote("shdw").await.unwrap();
        let outcome = engine
            .dispatch_raw_message("shdw", RawMessage::new("after cutover"))
            .await
            .unwrap();
        assert_eq!(outcome.message_id, 1);
        assert!(engine.shadow_mode());

        // full cutover clears the mode flag
        let errors = engine.cutover().await;
        assert!(errors.is_empty());
        assert!(!engine.shadow_mode());
    }

    #[tokio::test]
    async fn channel_writer_routes_between_channels() {
        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store.clone());
        engine.start().await.unwrap();

        let downstream =
            ChannelConfig::new("downstream", "Downstream", SourceConfig::channel_reader());
        engine.deploy(downstream).await.unwrap();
        engine.start_channel("downstream").await.unwrap();

        let upstream = ChannelConfig::new("upstream", "Upstream", SourceConfig::channel_reader())
            .add_destination(DestinationConfig::new(
                1,
                "To Downstream",
                DestinationKind::ChannelWriter {
                    target_channel_id: "downstream".to_string(),
                },
            ));
        engine.deploy(upstream).await.unwrap();
        engine.start_channel("upstream").await.unwrap();

        engine
            .dispatch_raw_message("upstream", RawMessage::new("routed payload"))
            .await
            .unwrap();

        // the downstream channel received its own message
        assert_eq!(
            store
                .connector_message_status("downstream", 1, 0)
                .await
                .unwrap(),
            Some(Status::Transformed)
        );
        let raw = store
            .load_content("downstream", 1, 0, ContentType::Raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.content, "routed payload");
        assert_eq!(
            store
                .connector_message_status("upstream", 1, 1)
                .await
                .unwrap(),
            Some(Status::Sent)
        );
    }

    #[tokio::test]
    async fn content_is_encrypted_at_rest_and_decrypted_on_read() {
        let encryptor = Arc::new(AesContentEncryptor::from_passphrase("unit-key"));
        let store = Arc::new(InMemoryStore::with_encryptor(encryptor));
        let engine = test_engine(store.clone());
        engine.start().await.unwrap();

        let channel = ChannelConfig::new("enc", "Encrypted", SourceConfig::channel_reader());
        engine.deploy(channel).await.unwrap();
        engine.start_channel("enc").await.unwrap();

        let body = "PID|1||12345^^^MRN||DOE^JANE";
        engine
            .dispatch_raw_message("enc", RawMessage::new(body))
            .await
            .unwrap();

        let raw = store
            .load_content("enc", 1, 0, ContentType::Raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.content, body);
        assert!(!raw.encrypted, "reads hand back plaintext");
    }

    #[tokio::test]
    async fn attachment_tokens_are_reinflated_before_dispatch() {
        let store = Arc::new(InMemoryStore::new());
        let engine = test_engine(store);
        engine.start().await.unwrap();

        let output = tempfile::tempdir().unwrap();
        let channel = ChannelConfig::new("att", "Attachments", SourceConfig::channel_reader())
            .add_destination(file_writer(1, &output));
        engine.deploy(channel).await.unwrap();
        engine.start_channel("att").await.unwrap();

        let attachment = Attachment::from_content(0, "application/pdf", b"%PDF-1.4 ...".to_vec());
        let token = attachment.token();
        let mut raw = RawMessage::new(format!("report follows: {}", token));
        raw.attachments.push(attachment);
        raw.source_map.insert("origin".into(), json!("test"));

        let outcome = engine.dispatch_raw_message("att", raw).await.unwrap();
        let out_path = output.path().join(format!("{}.out", outcome.message_id));
        wait_for("attachment output", || out_path.exists()).await;
        let written = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(written, "report follows: %PDF-1.4 ...");
    }
}
