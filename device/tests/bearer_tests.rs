#[cfg(feature = "std")]
mod tests {
    use core::future::Future;
    use drogue_mesh_bearer::drivers::ble::mesh::adv::controller::*;
    use drogue_mesh_bearer::drivers::ble::mesh::adv::data::*;
    use drogue_mesh_bearer::drivers::ble::mesh::adv::*;
    use drogue_mesh_bearer::testutil::*;
    use embassy_futures::select::{select, Either};
    use embassy_futures::yield_now;
    use embassy_time::Duration;
    use futures::executor::block_on;

    const CONTROLLER_ERROR: Status = Status(0x0C);

    /// Drive the bearer task until `script` completes.
    fn run_bearer<C, G, const N: usize, F>(bearer: &AdvBearer<'_, C, G, N>, script: F) -> F::Output
    where
        C: Controller,
        G: GattAdvertiser,
        F: Future,
    {
        block_on(async {
            match select(bearer.run(), script).await {
                Either::First(never) => never,
                Either::Second(out) => out,
            }
        })
    }

    async fn settle() {
        for _ in 0..10 {
            yield_now().await;
        }
    }

    async fn pdu<'a, C, G, const N: usize>(bearer: &AdvBearer<'a, C, G, N>, data: &[u8]) -> Adv<'a>
    where
        C: Controller,
        G: GattAdvertiser,
    {
        let mut adv = bearer
            .create(
                AdvType::Data,
                AdvTag::Local,
                Transmit::new(2, 20),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        adv.get_mut().unwrap().add_mem(data);
        adv
    }

    fn bytes(data: &[u8]) -> Payload {
        Payload::from_slice(data).unwrap()
    }

    /// Walk the set through a complete transmission after its create request was seen,
    /// consuming the start and remove requests it causes.
    async fn transmit<C: Controller, G: GattAdvertiser, const N: usize>(
        bearer: &AdvBearer<'_, C, G, N>,
        controller: &MockController,
    ) {
        bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));
        bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
        match controller.next_call().await {
            ControllerCall::Start { set, .. } => assert_eq!(AdvSet(0), set),
            other => panic!("unexpected call {:?}", other),
        }
        bearer.on_state_change(state_change(0, AdvState::Started, Status::SUCCESS));
        bearer.on_state_change(state_change(0, AdvState::Created, Status::TIMEOUT));
        assert_eq!(ControllerCall::Remove(AdvSet(0)), controller.next_call().await);
        bearer.on_state_change(state_change(0, AdvState::Idle, Status::SUCCESS));
    }

    #[test]
    fn test_sends_in_order_one_at_a_time() {
        let cb_a = RecordingCallbacks::new();
        let cb_b = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            let a = pdu(&bearer, &[0xA1, 0xA2]).await;
            let b = pdu(&bearer, &[0xB1]).await;
            bearer.send(a, Some(&cb_a)).unwrap();
            bearer.send(b, Some(&cb_b)).unwrap();

            match controller.next_call().await {
                ControllerCall::Create(params) => {
                    assert_eq!(3, params.max_events);
                    assert_eq!(scan_units(20), params.interval_min);
                    assert_eq!(scan_units(30), params.interval_max);
                    assert_eq!(AdvProperties::NON_CONNECTABLE, params.properties);
                    assert_eq!(OwnAddress::Static, params.own_address);
                }
                other => panic!("unexpected call {:?}", other),
            }

            bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));
            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            assert_eq!(
                ControllerCall::Start {
                    set: AdvSet(0),
                    adv_data: bytes(&[0x03, 0x2A, 0xA1, 0xA2]),
                    scan_rsp: None,
                },
                controller.next_call().await
            );
            assert_eq!(vec![Callback::Start(Ok(()))], cb_a.events());
            assert_eq!(Some(Duration::from_millis(60)), cb_a.duration());

            bearer.on_state_change(state_change(0, AdvState::Started, Status::SUCCESS));
            bearer.on_state_change(state_change(0, AdvState::Created, Status::TIMEOUT));
            assert_eq!(ControllerCall::Remove(AdvSet(0)), controller.next_call().await);
            assert!(cb_b.events().is_empty());

            bearer.on_state_change(state_change(0, AdvState::Idle, Status::SUCCESS));
            assert_eq!(
                vec![Callback::Start(Ok(())), Callback::End(Ok(()))],
                cb_a.events()
            );
            // a is released, b is still owned by the bearer
            assert_eq!(3, pool.free_count());

            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            transmit(&bearer, &controller).await;
            assert_eq!(
                vec![Callback::Start(Ok(())), Callback::End(Ok(()))],
                cb_b.events()
            );
            assert_eq!(4, pool.free_count());
        });

        assert_eq!(2, bearer.stats().planned(AdvTag::Local));
        assert_eq!(2, bearer.stats().succeeded(AdvTag::Local));
    }

    #[test]
    fn test_terminate_before_dispatch() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            let adv = pdu(&bearer, &[0x01]).await;
            let handle = adv.clone();
            bearer.send(adv, Some(&cb)).unwrap();
            bearer.terminate(&handle).unwrap();
            assert!(!handle.is_busy());
            drop(handle);

            settle().await;
            assert_eq!(None, controller.try_next_call());
            assert!(cb.events().is_empty());
            assert_eq!(4, pool.free_count());
        });
    }

    #[test]
    fn test_terminate_active_suppresses_callbacks() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            let adv = pdu(&bearer, &[0x01]).await;
            let handle = adv.clone();
            bearer.send(adv, Some(&cb)).unwrap();

            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));
            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Start { .. }
            ));
            bearer.on_state_change(state_change(0, AdvState::Started, Status::SUCCESS));

            bearer.terminate(&handle).unwrap();
            assert_eq!(ControllerCall::Stop(AdvSet(0)), controller.next_call().await);

            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            assert_eq!(ControllerCall::Remove(AdvSet(0)), controller.next_call().await);
            bearer.on_state_change(state_change(0, AdvState::Idle, Status::SUCCESS));

            assert_eq!(vec![Callback::Start(Ok(()))], cb.events());
            assert_eq!(1, handle.ref_count());
        });
    }

    #[test]
    fn test_controller_error_while_creating() {
        let cb_a = RecordingCallbacks::new();
        let cb_b = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            let a = pdu(&bearer, &[0x01]).await;
            bearer.send(a, Some(&cb_a)).unwrap();
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));

            bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));
            bearer.on_state_change(state_change(0, AdvState::Created, CONTROLLER_ERROR));
            assert_eq!(ControllerCall::Remove(AdvSet(0)), controller.next_call().await);
            assert!(cb_a.events().is_empty());

            bearer.on_state_change(state_change(0, AdvState::Idle, Status::SUCCESS));
            let failed = Err(AdvError::Controller(CONTROLLER_ERROR));
            assert_eq!(
                vec![Callback::Start(failed), Callback::End(failed)],
                cb_a.events()
            );
            assert_eq!(AdvState::Idle, bearer.state());
            assert_eq!(4, pool.free_count());

            // the set is usable again, with a clean error state
            let b = pdu(&bearer, &[0x02]).await;
            bearer.send(b, Some(&cb_b)).unwrap();
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            transmit(&bearer, &controller).await;
            assert_eq!(
                vec![Callback::Start(Ok(())), Callback::End(Ok(()))],
                cb_b.events()
            );
        });
    }

    #[test]
    fn test_rejected_create_reports_failure() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            controller.fail_next_create(Status(0x07));
            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, Some(&cb)).unwrap();
            settle().await;

            let failed = Err(AdvError::Controller(Status(0x07)));
            assert_eq!(vec![Callback::Start(failed), Callback::End(failed)], cb.events());
            assert_eq!(4, pool.free_count());

            let adv = pdu(&bearer, &[0x02]).await;
            bearer.send(adv, None).unwrap();
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
        });
    }

    #[test]
    fn test_disabled_bearer_drops_advertisements() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        run_bearer(&bearer, async {
            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, Some(&cb)).unwrap();
            settle().await;

            assert_eq!(None, controller.try_next_call());
            assert!(cb.events().is_empty());
            assert_eq!(4, pool.free_count());
        });
    }

    #[test]
    fn test_suspended_bearer_refuses_create() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        bearer.suspend();
        let result = block_on(bearer.create(
            AdvType::Beacon,
            AdvTag::Local,
            Transmit(0),
            Duration::from_millis(10),
        ));
        assert_eq!(Some(AdvError::Suspended), result.err());

        bearer.resume();
        let adv = block_on(bearer.create(
            AdvType::Beacon,
            AdvTag::Relay,
            Transmit(0),
            Duration::from_millis(10),
        ))
        .unwrap();
        assert_eq!(AdvType::Beacon, adv.kind());
        assert_eq!(AdvTag::Relay, adv.tag());
    }

    #[test]
    fn test_pool_exhaustion() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 1> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        let _held = block_on(bearer.create(
            AdvType::Data,
            AdvTag::Local,
            Transmit(0),
            Duration::from_millis(10),
        ))
        .unwrap();
        let result = block_on(bearer.create(
            AdvType::Data,
            AdvTag::Local,
            Transmit(0),
            Duration::from_millis(10),
        ));
        assert_eq!(
            Some(AdvError::Alloc(drogue_mesh_bearer::drivers::ble::mesh::buf::AllocError::Empty)),
            result.err()
        );
    }

    #[test]
    fn test_queue_full() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 1> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        let adv = block_on(bearer.create(
            AdvType::Data,
            AdvTag::Local,
            Transmit(0),
            Duration::from_millis(10),
        ))
        .unwrap();
        for _ in 0..ADV_QUEUE_SIZE {
            bearer.send(adv.clone(), None).unwrap();
        }
        assert_eq!(Err(AdvError::QueueFull), bearer.send(adv.clone(), None));
        assert_eq!(ADV_QUEUE_SIZE as u8 + 1, adv.ref_count());
        assert_eq!(ADV_QUEUE_SIZE as u32, bearer.stats().planned(AdvTag::Local));

        bearer.teardown();
        assert_eq!(1, adv.ref_count());
    }

    #[test]
    fn test_teardown_disables_until_enabled() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            bearer.teardown();
            assert!(!bearer.is_enabled());

            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, Some(&cb)).unwrap();
            settle().await;
            assert_eq!(None, controller.try_next_call());
            assert!(cb.events().is_empty());
            assert_eq!(4, pool.free_count());

            bearer.enable();
            let adv = pdu(&bearer, &[0x02]).await;
            bearer.send(adv, Some(&cb)).unwrap();
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            transmit(&bearer, &controller).await;
            assert_eq!(
                vec![Callback::Start(Ok(())), Callback::End(Ok(()))],
                cb.events()
            );
        });
    }

    #[test]
    fn test_send_completion() {
        let completion = SendCompletion::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, Some(&completion)).unwrap();
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            transmit(&bearer, &controller).await;
            assert_eq!(Ok(()), completion.started().await);
            assert_eq!(Ok(()), completion.ended().await);
        });
    }

    #[test]
    fn test_send_data_bypasses_queue() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 1> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        run_bearer(&bearer, async {
            bearer
                .send_data(
                    4,
                    100,
                    &[AdStructure::new(
                        drogue_mesh_bearer::drivers::ble::mesh::URI,
                        b"\x17//example",
                    )],
                )
                .await
                .unwrap();
            match controller.next_call().await {
                ControllerCall::Create(params) => {
                    assert_eq!(4, params.max_events);
                    assert_eq!(scan_units(100), params.interval_min);
                }
                other => panic!("unexpected call {:?}", other),
            }

            let oversized = [0u8; 30];
            assert_eq!(
                Err(AdvError::AdTooLong),
                bearer
                    .send_data(1, 100, &[AdStructure::new(FLAGS, &oversized)])
                    .await
            );
        });
    }

    #[test]
    fn test_send_data_huge_interval_clamped() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 1> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, (), &pool);

        run_bearer(&bearer, async {
            bearer
                .send_data(1, u32::MAX, &[AdStructure::new(FLAGS, &[0x06])])
                .await
                .unwrap();
            match controller.next_call().await {
                ControllerCall::Create(params) => {
                    assert_eq!(INTERVAL_MAX, params.interval_min);
                    assert_eq!(INTERVAL_MAX, params.interval_max);
                }
                other => panic!("unexpected call {:?}", other),
            }
        });
    }

    struct ProxyAdvertiser;

    impl GattAdvertiser for ProxyAdvertiser {
        fn connectable_advert(&self) -> Option<ConnectableAdvert> {
            Some(ConnectableAdvert {
                params: AdvParams {
                    own_address: OwnAddress::Static,
                    properties: AdvProperties::UNDIRECTED_CONNECTABLE,
                    interval_min: scan_units(100),
                    interval_max: scan_units(150),
                    max_events: 0,
                    timeout: Duration::from_ticks(0),
                },
                ad: AdPayload::pack(&[
                    AdStructure::new(FLAGS, &[0x06]),
                    AdStructure::new(UUID16_ALL, &[0x28, 0x18]),
                ])
                .ok()?,
                sd: AdPayload::pack(&[AdStructure::new(SERVICE_DATA16, &[0x28, 0x18, 0x00])])
                    .ok()?,
            })
        }
    }

    #[test]
    fn test_mesh_traffic_preempts_connectable_advert() {
        let cb = RecordingCallbacks::new();
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, ProxyAdvertiser, &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            match controller.next_call().await {
                ControllerCall::Create(params) => assert!(params.properties.is_connectable()),
                other => panic!("unexpected call {:?}", other),
            }
            bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));
            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            match controller.next_call().await {
                ControllerCall::Start { scan_rsp, .. } => {
                    assert_eq!(Some(bytes(&[0x04, SERVICE_DATA16, 0x28, 0x18, 0x00])), scan_rsp)
                }
                other => panic!("unexpected call {:?}", other),
            }
            bearer.on_state_change(state_change(0, AdvState::Started, Status::SUCCESS));

            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, Some(&cb)).unwrap();
            assert_eq!(ControllerCall::Stop(AdvSet(0)), controller.next_call().await);

            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            assert_eq!(ControllerCall::Remove(AdvSet(0)), controller.next_call().await);
            bearer.on_state_change(state_change(0, AdvState::Idle, Status::SUCCESS));

            match controller.next_call().await {
                ControllerCall::Create(params) => assert!(!params.properties.is_connectable()),
                other => panic!("unexpected call {:?}", other),
            }
            transmit(&bearer, &controller).await;
            assert_eq!(
                vec![Callback::Start(Ok(())), Callback::End(Ok(()))],
                cb.events()
            );

            // queue drained, connectable advertising resumes
            match controller.next_call().await {
                ControllerCall::Create(params) => assert!(params.properties.is_connectable()),
                other => panic!("unexpected call {:?}", other),
            }
        });
    }

    #[test]
    fn test_stop_latched_until_started() {
        let controller = MockController::new();
        let pool: AdvPool<'_, 4> = AdvPool::new();
        let bearer = AdvBearer::new(&controller, ProxyAdvertiser, &pool);
        bearer.enable();

        run_bearer(&bearer, async {
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Create(_)
            ));
            bearer.on_state_change(state_change(0, AdvState::Creating, Status::SUCCESS));

            let adv = pdu(&bearer, &[0x01]).await;
            bearer.send(adv, None).unwrap();
            settle().await;
            assert_eq!(None, controller.try_next_call());

            bearer.on_state_change(state_change(0, AdvState::Created, Status::SUCCESS));
            assert!(matches!(
                controller.next_call().await,
                ControllerCall::Start { .. }
            ));
            bearer.on_state_change(state_change(0, AdvState::Started, Status::SUCCESS));
            assert_eq!(ControllerCall::Stop(AdvSet(0)), controller.next_call().await);
        });
    }
}
